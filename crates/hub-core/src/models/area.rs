use serde::{Deserialize, Serialize};

/// Geographic coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Named region, optionally with a boundary polygon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub polygon: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Point>,
}

impl Area {
    /// Explicit center or the vertex average of the polygon
    pub fn center(&self) -> Option<Point> {
        if self.center.is_some() {
            return self.center;
        }
        if self.polygon.is_empty() {
            return None;
        }
        let n = self.polygon.len() as f64;
        let (lat, lon) = self
            .polygon
            .iter()
            .fold((0.0, 0.0), |(lat, lon), p| (lat + p.lat, lon + p.lon));
        Some(Point::new(lat / n, lon / n))
    }
}

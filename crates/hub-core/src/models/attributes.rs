//! Typed attribute and settings schemas

use chrono::DateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Flat name -> value map as carried on the bus
pub type AttributeValues = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Int,
    Float,
    String,
    Bool,
    Array,
    Map,
    Time,
    Point,
}

impl AttributeType {
    /// Convert `value` into this type, `None` when it cannot be represented
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            AttributeType::Int => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Value::from),
                Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
                Value::Bool(b) => Some(Value::from(i64::from(*b))),
                _ => None,
            },
            AttributeType::Float => match value {
                Value::Number(n) => n.as_f64().map(Value::from),
                Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
                _ => None,
            },
            AttributeType::String => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            AttributeType::Bool => match value {
                Value::Bool(_) => Some(value.clone()),
                Value::String(s) => match s.trim() {
                    "true" | "on" | "1" => Some(Value::Bool(true)),
                    "false" | "off" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                Value::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
                _ => None,
            },
            AttributeType::Array => value.is_array().then(|| value.clone()),
            AttributeType::Map => value.is_object().then(|| value.clone()),
            AttributeType::Time => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| Value::String(t.to_rfc3339())),
            AttributeType::Point => {
                let (lat, lon) = match value {
                    Value::Array(items) if items.len() == 2 => (items[0].as_f64()?, items[1].as_f64()?),
                    Value::Object(map) => (map.get("lat")?.as_f64()?, map.get("lon")?.as_f64()?),
                    _ => return None,
                };
                Some(json!({ "lat": lat, "lon": lon }))
            }
        }
    }
}

/// One typed slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Ordered typed schema with current values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(IndexMap<String, Attribute>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style declaration of a slot
    pub fn with(mut self, name: impl Into<String>, kind: AttributeType) -> Self {
        self.0.insert(name.into(), Attribute { kind, value: None });
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, attribute: Attribute) {
        self.0.insert(name.into(), attribute);
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply a delta. Unknown names and values of the wrong shape are
    /// returned as rejected; the rest are coerced in place.
    pub fn merge(&mut self, values: &AttributeValues) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for (name, raw) in values {
            let Some(slot) = self.0.get_mut(name) else {
                outcome.rejected.push(name.clone());
                continue;
            };
            match slot.kind.coerce(raw) {
                Some(Value::Null) => {
                    if slot.value.take().is_some() {
                        outcome.changed = true;
                    }
                }
                Some(value) => {
                    if slot.value.as_ref() != Some(&value) {
                        slot.value = Some(value);
                        outcome.changed = true;
                    }
                }
                None => outcome.rejected.push(name.clone()),
            }
        }
        outcome
    }

    /// Flatten to plain values, unset slots become null
    pub fn values(&self) -> AttributeValues {
        self.0
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changed: bool,
    pub rejected: Vec<String>,
}

//! Topic patterns with a single-level `+` wildcard

use crate::BusError;

/// Parsed subscription pattern, e.g. `system/entities/+`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Any,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let segments = pattern
            .split('/')
            .map(|s| match s {
                "+" => Ok(Segment::Any),
                s if s.contains('+') || s.contains('#') => {
                    Err(BusError::InvalidPattern(pattern.to_string()))
                }
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete topic falls under this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');
        for segment in &self.segments {
            match (segment, parts.next()) {
                (_, None) => return false,
                (Segment::Any, Some(_)) => {}
                (Segment::Literal(lit), Some(part)) if lit == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

/// Concrete topics may not carry wildcard characters
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

//! Error taxonomy shared by every hub component

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Structured validation failures, meant for the caller and never for the bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Record an error when `value` is blank or longer than `max`
    pub fn require(&mut self, field: &str, value: &str, max: usize) {
        if value.trim().is_empty() {
            self.add(field, "is required");
        } else if value.chars().count() > max {
            self.add(field, format!("must be at most {max} characters"));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    /// Ok when nothing was recorded
    pub fn into_result(self) -> HubResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(HubError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Errors returned by synchronous hub operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("plugin not loaded: {0}")]
    PluginNotLoaded(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        HubError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        HubError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        HubError::Internal(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::NotFound { .. })
    }
}

impl From<ValidationErrors> for HubError {
    fn from(errors: ValidationErrors) -> Self {
        HubError::Validation(errors)
    }
}

impl From<crate::EntityIdError> for HubError {
    fn from(err: crate::EntityIdError) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add("entity_id", err.to_string());
        HubError::Validation(errors)
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_collects_fields() {
        let mut errors = ValidationErrors::new();
        errors.require("name", "  ", 255);
        errors.require("description", &"x".repeat(300), 255);
        errors.require("plugin_name", "state_change", 255);

        assert!(errors.has("name"));
        assert!(errors.has("description"));
        assert!(!errors.has("plugin_name"));
        assert!(matches!(errors.into_result(), Err(HubError::Validation(_))));
    }

    #[test]
    fn test_display() {
        let err = HubError::not_found("entity", "sensor.kitchen");
        assert_eq!(err.to_string(), "entity not found: sensor.kitchen");
        assert!(err.is_not_found());
        assert_eq!(
            HubError::PluginNotLoaded("zigbee".into()).to_string(),
            "plugin not loaded: zigbee"
        );
    }
}

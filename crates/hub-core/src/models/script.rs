use serde::{Deserialize, Serialize};

use crate::ValidationErrors;

/// User authored script source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    pub source: String,
    #[serde(default)]
    pub description: String,
}

fn default_lang() -> String {
    "jinja".to_string()
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            lang: default_lang(),
            source: source.into(),
            description: String::new(),
        }
    }

    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.require("name", &self.name, 255);
        if self.lang != "jinja" {
            errors.add("lang", format!("unsupported language {}", self.lang));
        }
        errors
    }
}

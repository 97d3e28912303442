//! Automation records: triggers, conditions, actions and tasks

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EntityId, ValidationErrors};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Plugin providing the trigger kind, e.g. `state_change`
    pub plugin_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub entity_ids: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
    #[serde(default)]
    pub payload: Value,
}

impl Trigger {
    pub fn new(name: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            plugin_name: plugin_name.into(),
            enabled: true,
            entity_ids: Vec::new(),
            script_id: None,
            area_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_ids.push(entity_id);
        self
    }

    pub fn with_script(mut self, script_id: i64) -> Self {
        self.script_id = Some(script_id);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.require("name", &self.name, 255);
        errors.require("plugin_name", &self.plugin_name, 255);
        if self.description.chars().count() > 255 {
            errors.add("description", "must be at most 255 characters");
        }
        errors
    }
}

/// How a task combines its conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    #[default]
    And,
    Or,
}

impl ConditionType {
    pub fn combine(&self, results: impl IntoIterator<Item = bool>) -> bool {
        let mut results = results.into_iter();
        match self {
            ConditionType::And => results.all(|r| r),
            ConditionType::Or => results.any(|r| r),
        }
    }
}

/// Script predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            script_id: None,
            area_id: None,
        }
    }

    pub fn with_script(mut self, script_id: i64) -> Self {
        self.script_id = Some(script_id);
        self
    }
}

/// Script or direct entity invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            script_id: None,
            area_id: None,
            entity_id: None,
            action_name: None,
        }
    }

    pub fn with_script(mut self, script_id: i64) -> Self {
        self.script_id = Some(script_id);
        self
    }

    /// Call `action_name` on `entity_id`
    pub fn call(mut self, entity_id: EntityId, action_name: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id);
        self.action_name = Some(action_name.into());
        self
    }

    /// Activate the scene entity `entity_id`
    pub fn scene(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self.action_name = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub condition: ConditionType,
    #[serde(default)]
    pub trigger_ids: Vec<i64>,
    #[serde(default)]
    pub condition_ids: Vec<i64>,
    #[serde(default)]
    pub action_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
}

impl Task {
    pub fn new(name: impl Into<String>, condition: ConditionType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            enabled: true,
            condition,
            trigger_ids: Vec::new(),
            condition_ids: Vec::new(),
            action_ids: Vec::new(),
            area_id: None,
        }
    }

    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.require("name", &self.name, 255);
        if self.description.chars().count() > 255 {
            errors.add("description", "must be at most 255 characters");
        }
        errors
    }
}

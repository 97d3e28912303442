//! Persisted entity description

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{Attributes, AttributeValues};
use crate::{EntityId, ValidationErrors};

/// Action an entity understands, optionally backed by its own script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<i64>,
}

impl EntityAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            icon: None,
            script_id: None,
        }
    }

    pub fn with_script(mut self, script_id: i64) -> Self {
        self.script_id = Some(script_id);
        self
    }
}

/// Named state an entity may be in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl EntityState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            icon: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
    #[serde(default)]
    pub auto_load: bool,
    #[serde(default)]
    pub actions: Vec<EntityAction>,
    #[serde(default)]
    pub states: Vec<EntityState>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub settings: Attributes,
    /// Entity level scripts, consulted when an action has no script of its own
    #[serde(default)]
    pub script_ids: Vec<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(id: EntityId) -> Self {
        let now = Utc::now();
        Self {
            id,
            description: String::new(),
            icon: None,
            parent_id: None,
            area_id: None,
            auto_load: true,
            actions: Vec::new(),
            states: Vec::new(),
            attributes: Attributes::new(),
            settings: Attributes::new(),
            script_ids: Vec::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn plugin_name(&self) -> &str {
        self.id.plugin_name()
    }

    pub fn with_action(mut self, action: EntityAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_state(mut self, state: EntityState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_script(mut self, script_id: i64) -> Self {
        self.script_ids.push(script_id);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Every script this entity depends on, entity level first
    pub fn all_script_ids(&self) -> Vec<i64> {
        let mut seen = HashSet::new();
        self.script_ids
            .iter()
            .copied()
            .chain(self.actions.iter().filter_map(|a| a.script_id))
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        if self.description.chars().count() > 255 {
            errors.add("description", "must be at most 255 characters");
        }
        let mut names = HashSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                errors.add("actions", "action name is required");
            } else if !names.insert(action.name.as_str()) {
                errors.add("actions", format!("duplicate action {}", action.name));
            }
        }
        let mut names = HashSet::new();
        for state in &self.states {
            if state.name.trim().is_empty() {
                errors.add("states", "state name is required");
            } else if !names.insert(state.name.as_str()) {
                errors.add("states", format!("duplicate state {}", state.name));
            }
        }
        if self.parent_id.as_ref() == Some(&self.id) {
            errors.add("parent_id", "entity cannot be its own parent");
        }
        errors
    }
}

/// One mirrored state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStorage {
    #[serde(default)]
    pub id: i64,
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub attributes: AttributeValues,
    pub created_at: DateTime<Utc>,
}

//! Bus events and topic names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{AttributeValues, EntityState};
use crate::EntityId;

/// Topic names and patterns
pub mod topics {
    use crate::EntityId;

    pub const ENTITIES: &str = "system/entities/+";
    pub const PLUGINS: &str = "system/plugins/+";
    pub const MODEL_ENTITIES: &str = "system/models/entities/+";
    pub const MODEL_SCRIPTS: &str = "system/models/scripts/+";
    pub const TRIGGERS: &str = "system/automation/triggers/+";
    pub const MODEL_TRIGGERS: &str = "system/models/triggers/+";
    pub const TASKS: &str = "system/automation/tasks/+";
    pub const MODEL_TASKS: &str = "system/models/tasks/+";
    pub const ACTIONS: &str = "system/automation/actions/+";
    pub const SERVICES: &str = "system/services/+";

    pub fn entity(id: &EntityId) -> String {
        format!("system/entities/{id}")
    }

    pub fn plugin(name: &str) -> String {
        format!("system/plugins/{name}")
    }

    pub fn model_entity(id: &EntityId) -> String {
        format!("system/models/entities/{id}")
    }

    pub fn model_script(id: i64) -> String {
        format!("system/models/scripts/{id}")
    }

    pub fn trigger(id: i64) -> String {
        format!("system/automation/triggers/{id}")
    }

    pub fn model_trigger(id: i64) -> String {
        format!("system/models/triggers/{id}")
    }

    pub fn task(id: i64) -> String {
        format!("system/automation/tasks/{id}")
    }

    pub fn model_task(id: i64) -> String {
        format!("system/models/tasks/{id}")
    }

    pub fn action(id: i64) -> String {
        format!("system/automation/actions/{id}")
    }

    pub fn service(name: &str) -> String {
        format!("system/services/{name}")
    }
}

/// Point in time view of an actor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EntityState>,
    #[serde(default)]
    pub attributes: AttributeValues,
    #[serde(default)]
    pub settings: AttributeValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn state_name(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.name.as_str())
    }
}

/// Requested mutation of an actor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,
    #[serde(default)]
    pub attribute_values: AttributeValues,
    #[serde(default)]
    pub settings_value: AttributeValues,
    #[serde(default)]
    pub storage_save: bool,
}

impl StateParams {
    pub fn state(name: impl Into<String>) -> Self {
        Self {
            new_state: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_attributes(mut self, values: AttributeValues) -> Self {
        self.attribute_values = values;
        self
    }

    pub fn stored(mut self) -> Self {
        self.storage_save = true;
        self
    }
}

/// Everything that travels over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PluginLoaded {
        plugin_name: String,
    },
    PluginUnloaded {
        plugin_name: String,
    },
    StateChanged {
        plugin_name: String,
        entity_id: EntityId,
        old_state: StateSnapshot,
        new_state: StateSnapshot,
        storage_save: bool,
    },
    LastStateChanged {
        plugin_name: String,
        entity_id: EntityId,
        old_state: StateSnapshot,
        new_state: StateSnapshot,
    },
    GetLastState {
        entity_id: EntityId,
    },
    EntitySetState {
        entity_id: EntityId,
        #[serde(flatten)]
        params: StateParams,
    },
    CallEntityAction {
        plugin_name: String,
        entity_id: EntityId,
        action_name: String,
        #[serde(default)]
        args: Value,
    },
    CallScene {
        plugin_name: String,
        entity_id: EntityId,
        #[serde(default)]
        args: Value,
    },
    EntityLoaded {
        plugin_name: String,
        entity_id: EntityId,
    },
    EntityUnloaded {
        plugin_name: String,
        entity_id: EntityId,
    },
    CreatedEntityModel {
        entity_id: EntityId,
    },
    UpdatedEntityModel {
        entity_id: EntityId,
    },
    RemovedEntityModel {
        entity_id: EntityId,
    },
    CommandLoadEntity {
        entity_id: EntityId,
    },
    CommandUnloadEntity {
        entity_id: EntityId,
    },
    UpdatedScriptModel {
        script_id: i64,
    },
    RemovedScriptModel {
        script_id: i64,
    },
    CommandEnableTrigger {
        id: i64,
    },
    CommandDisableTrigger {
        id: i64,
    },
    CallTrigger {
        id: i64,
    },
    CreatedTriggerModel {
        id: i64,
    },
    UpdatedTriggerModel {
        id: i64,
    },
    RemovedTriggerModel {
        id: i64,
    },
    TriggerCompleted {
        id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<EntityId>,
        #[serde(default)]
        args: Value,
    },
    CommandEnableTask {
        id: i64,
    },
    CommandDisableTask {
        id: i64,
    },
    CreatedTaskModel {
        id: i64,
    },
    UpdatedTaskModel {
        id: i64,
    },
    RemovedTaskModel {
        id: i64,
    },
    CallAction {
        id: i64,
    },
    ServiceStarted {
        service: String,
    },
    ServiceStopped {
        service: String,
    },
}

impl Event {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PluginLoaded { .. } => "plugin_loaded",
            Event::PluginUnloaded { .. } => "plugin_unloaded",
            Event::StateChanged { .. } => "state_changed",
            Event::LastStateChanged { .. } => "last_state_changed",
            Event::GetLastState { .. } => "get_last_state",
            Event::EntitySetState { .. } => "entity_set_state",
            Event::CallEntityAction { .. } => "call_entity_action",
            Event::CallScene { .. } => "call_scene",
            Event::EntityLoaded { .. } => "entity_loaded",
            Event::EntityUnloaded { .. } => "entity_unloaded",
            Event::CreatedEntityModel { .. } => "created_entity_model",
            Event::UpdatedEntityModel { .. } => "updated_entity_model",
            Event::RemovedEntityModel { .. } => "removed_entity_model",
            Event::CommandLoadEntity { .. } => "command_load_entity",
            Event::CommandUnloadEntity { .. } => "command_unload_entity",
            Event::UpdatedScriptModel { .. } => "updated_script_model",
            Event::RemovedScriptModel { .. } => "removed_script_model",
            Event::CommandEnableTrigger { .. } => "command_enable_trigger",
            Event::CommandDisableTrigger { .. } => "command_disable_trigger",
            Event::CallTrigger { .. } => "call_trigger",
            Event::CreatedTriggerModel { .. } => "created_trigger_model",
            Event::UpdatedTriggerModel { .. } => "updated_trigger_model",
            Event::RemovedTriggerModel { .. } => "removed_trigger_model",
            Event::TriggerCompleted { .. } => "trigger_completed",
            Event::CommandEnableTask { .. } => "command_enable_task",
            Event::CommandDisableTask { .. } => "command_disable_task",
            Event::CreatedTaskModel { .. } => "created_task_model",
            Event::UpdatedTaskModel { .. } => "updated_task_model",
            Event::RemovedTaskModel { .. } => "removed_task_model",
            Event::CallAction { .. } => "call_action",
            Event::ServiceStarted { .. } => "service_started",
            Event::ServiceStopped { .. } => "service_stopped",
        }
    }

    /// Events an actor mailbox accepts
    pub fn is_actor_command(&self) -> bool {
        matches!(self, Event::CallEntityAction { .. } | Event::CallScene { .. })
    }
}

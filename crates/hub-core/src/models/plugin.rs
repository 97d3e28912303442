//! Plugin records and declared capabilities

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Attributes, EntityAction, EntityState};

/// What a plugin contributes and which actor schemas it allows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOptions {
    #[serde(default)]
    pub triggers: bool,
    #[serde(default)]
    pub actors: bool,
    #[serde(default)]
    pub actor_custom_attrs: bool,
    #[serde(default)]
    pub actor_custom_actions: bool,
    #[serde(default)]
    pub actor_custom_states: bool,
    #[serde(default)]
    pub actor_custom_settings: bool,
    #[serde(default)]
    pub actor_attrs: Attributes,
    #[serde(default)]
    pub actor_actions: Vec<EntityAction>,
    #[serde(default)]
    pub actor_states: Vec<EntityState>,
    #[serde(default)]
    pub actor_settings: Attributes,
    #[serde(default)]
    pub settings: Attributes,
}

/// How a plugin reached the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Built in and loaded by default
    System,
    /// Built in, loaded only when enabled
    BuiltIn,
    /// Discovered from the plugins directory, needs install
    Installable,
}

/// Persisted plugin record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub options: PluginOptions,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub settings: Value,
}

impl PluginRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            enabled: false,
            system: false,
            external: false,
            options: PluginOptions::default(),
            depends: Vec::new(),
            settings: Value::Null,
        }
    }
}

/// Runtime view of a plugin for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub loaded: bool,
    pub enabled: bool,
    pub system: bool,
    pub depends: Vec<String>,
    pub options: PluginOptions,
}

//! Entity ID type representing a `<plugin>.<local>` pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must contain a '.' separator")]
    InvalidFormat,

    #[error("plugin name cannot be empty")]
    EmptyPlugin,

    #[error("local name cannot be empty")]
    EmptyName,

    #[error("plugin name must be ascii alphanumeric with underscores")]
    InvalidPluginChars,

    #[error("local name cannot contain whitespace, '/', '+' or '#'")]
    InvalidNameChars,
}

/// Globally unique entity identity, e.g. `zigbee2mqtt.0x00158d00031c8ef3`
///
/// The part before the first period names the owning plugin. The local part
/// may contain further periods but nothing that would break a bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    plugin: String,
    name: String,
}

impl EntityId {
    pub fn new(plugin: impl Into<String>, name: impl Into<String>) -> Result<Self, EntityIdError> {
        let plugin = plugin.into();
        let name = name.into();

        if plugin.is_empty() {
            return Err(EntityIdError::EmptyPlugin);
        }
        if name.is_empty() {
            return Err(EntityIdError::EmptyName);
        }
        if !Self::is_valid_plugin(&plugin) {
            return Err(EntityIdError::InvalidPluginChars);
        }
        if !Self::is_valid_name(&name) {
            return Err(EntityIdError::InvalidNameChars);
        }

        Ok(Self { plugin, name })
    }

    /// Name of the plugin that owns this entity
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// Local part of the id
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_valid_plugin(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    fn is_valid_name(s: &str) -> bool {
        !s.chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '+' || c == '#')
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (plugin, name) = s.split_once('.').ok_or(EntityIdError::InvalidFormat)?;
        Self::new(plugin, name)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plugin, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id() {
        let id: EntityId = "sensorA.device1".parse().unwrap();
        assert_eq!(id.plugin_name(), "sensorA");
        assert_eq!(id.name(), "device1");
        assert_eq!(id.to_string(), "sensorA.device1");
    }

    #[test]
    fn test_local_name_keeps_extra_periods() {
        let id: EntityId = "modbus_rtu.floor.1".parse().unwrap();
        assert_eq!(id.plugin_name(), "modbus_rtu");
        assert_eq!(id.name(), "floor.1");
    }

    #[test]
    fn test_invalid_format() {
        assert_eq!(
            "no_separator".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            ".device".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyPlugin
        );
        assert_eq!(
            "sensor.".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyName
        );
    }

    #[test]
    fn test_topic_breaking_chars_rejected() {
        assert_eq!(
            "sensor.a/b".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidNameChars
        );
        assert_eq!(
            "sen-sor.a".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidPluginChars
        );
    }

    #[test]
    fn test_serde_roundtrip_as_string() {
        let id: EntityId = "sensor.kitchen".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sensor.kitchen\"");
        assert!(serde_json::from_str::<EntityId>("\"bad\"").is_err());
    }
}

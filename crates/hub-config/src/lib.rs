//! Hub configuration
//!
//! Read from `hub.yaml` in the config directory. Every field has a default,
//! so a missing file yields a working setup. `HUB_*` environment variables
//! override individual values after the file is parsed.

mod error;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub use error::{ConfigError, ConfigResult};

pub const CONFIG_FILE: &str = "hub.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of snapshot files, relative to the config dir
    pub path: PathBuf,
    /// Keep records in memory only when false
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".storage"),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for external plugin manifests
    pub directory: Option<PathBuf>,
    pub page_size: usize,
    /// Create enabled records for system plugins missing from storage
    pub seed_system: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            page_size: hub_core::DEFAULT_PAGE_SIZE,
            seed_system: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub mailbox_depth: usize,
    pub page_size: usize,
    pub last_state_ttl_secs: u64,
    pub placeholder_ttl_secs: u64,
    /// Reload or unload entities whose scripts change
    pub restart_component_if_script_changed: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mailbox_depth: hub_core::DEFAULT_MAILBOX_DEPTH,
            page_size: hub_core::DEFAULT_PAGE_SIZE,
            last_state_ttl_secs: 30,
            placeholder_ttl_secs: 10,
            restart_component_if_script_changed: false,
        }
    }
}

impl SupervisorConfig {
    pub fn last_state_ttl(&self) -> Duration {
        Duration::from_secs(self.last_state_ttl_secs)
    }

    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_secs(self.placeholder_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub page_size: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            page_size: hub_core::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub storage: StorageConfig,
    pub plugins: PluginsConfig,
    pub supervisor: SupervisorConfig,
    pub automation: AutomationConfig,
    pub logger: LoggerConfig,
}

impl HubConfig {
    /// Load `hub.yaml` from `config_dir` and apply process environment overrides
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = config_dir.as_ref().join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            debug!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir.as_ref());
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Apply `HUB_*` overrides looked up through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(v) = lookup("HUB_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HUB_STORAGE_PERSIST") {
            self.storage.persist = parse("HUB_STORAGE_PERSIST", &v)?;
        }
        if let Some(v) = lookup("HUB_PLUGINS_DIRECTORY") {
            self.plugins.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HUB_PLUGINS_PAGE_SIZE") {
            self.plugins.page_size = parse("HUB_PLUGINS_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("HUB_SUPERVISOR_MAILBOX_DEPTH") {
            self.supervisor.mailbox_depth = parse("HUB_SUPERVISOR_MAILBOX_DEPTH", &v)?;
        }
        if let Some(v) = lookup("HUB_RESTART_COMPONENT_IF_SCRIPT_CHANGED") {
            self.supervisor.restart_component_if_script_changed =
                parse("HUB_RESTART_COMPONENT_IF_SCRIPT_CHANGED", &v)?;
        }
        if let Some(v) = lookup("HUB_LOG_LEVEL") {
            self.logger.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("plugins.page_size", self.plugins.page_size),
            ("supervisor.page_size", self.supervisor.page_size),
            ("supervisor.mailbox_depth", self.supervisor.mailbox_depth),
            ("automation.page_size", self.automation.page_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.supervisor.last_state_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "supervisor.last_state_ttl_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Storage directory resolved against `config_dir`
    pub fn storage_dir(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(&self.storage.path)
    }

    /// Plugin directory resolved against `config_dir`
    pub fn plugins_dir(&self, config_dir: &Path) -> Option<PathBuf> {
        self.plugins.directory.as_ref().map(|dir| config_dir.join(dir))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.supervisor.mailbox_depth, 1000);
        assert_eq!(config.plugins.page_size, 500);
        assert_eq!(config.supervisor.last_state_ttl(), Duration::from_secs(30));
        assert!(!config.supervisor.restart_component_if_script_changed);
    }

    #[test]
    fn test_partial_yaml() {
        let config = HubConfig::from_yaml_str(
            "supervisor:\n  restart_component_if_script_changed: true\n  mailbox_depth: 10\nlogger:\n  level: debug\n",
        )
        .unwrap();
        assert!(config.supervisor.restart_component_if_script_changed);
        assert_eq!(config.supervisor.mailbox_depth, 10);
        assert_eq!(config.supervisor.page_size, 500);
        assert_eq!(config.logger.level, "debug");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HUB_SUPERVISOR_MAILBOX_DEPTH", "64"),
            ("HUB_RESTART_COMPONENT_IF_SCRIPT_CHANGED", "true"),
        ]);
        let mut config = HubConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.supervisor.mailbox_depth, 64);
        assert!(config.supervisor.restart_component_if_script_changed);

        let bad = |k: &str| (k == "HUB_PLUGINS_PAGE_SIZE").then(|| "many".to_string());
        assert!(matches!(
            HubConfig::default().apply_env(bad),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = HubConfig::default();
        config.supervisor.mailbox_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "plugins:\n  directory: plugins\n",
        )
        .unwrap();
        let config = HubConfig::load(dir.path()).unwrap();
        assert_eq!(
            config.plugins_dir(dir.path()),
            Some(dir.path().join("plugins"))
        );

        std::fs::write(dir.path().join(CONFIG_FILE), "plugins: [").unwrap();
        assert!(matches!(
            HubConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}

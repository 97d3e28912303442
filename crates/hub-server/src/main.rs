//! Home automation hub
//!
//! Main entry point: `hub [CONFIG_DIR]`, the config directory defaults to
//! the working directory.

use anyhow::{Context, Result};
use hub_automation::{SharedTaskManager, SharedTriggerManager, TaskManager, TriggerManager, TriggersPlugin};
use hub_config::HubConfig;
use hub_core::{topics, Event};
use hub_event_bus::{EventBus, SharedEventBus};
use hub_script::ScriptService;
use hub_storage::{Repositories, Storage, StorageError};
use hub_supervisor::{
    Plugin, PluginManager, PluginService, ProcessPluginLoader, Registry, SharedPluginManager, SharedSupervisor,
    StaticLoader, Supervisor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "hub";

/// The running hub
pub struct Hub {
    pub bus: SharedEventBus,
    pub repos: Repositories,
    pub manager: SharedPluginManager,
    pub supervisor: SharedSupervisor,
    pub triggers: SharedTriggerManager,
    pub tasks: SharedTaskManager,
    builtin: Vec<String>,
}

impl Hub {
    /// Wire every part together; nothing runs until [`Hub::start`]
    pub async fn new(config: &HubConfig, config_dir: &Path) -> Result<Self> {
        let repos = if config.storage.persist {
            let dir = config.storage_dir(config_dir);
            Repositories::open(Storage::new(&dir))
                .await
                .with_context(|| format!("opening storage in {}", dir.display()))?
        } else {
            Repositories::in_memory()
        };
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let service = PluginService::new(bus.clone(), repos.clone(), ScriptService::new())
            .with_mailbox_depth(config.supervisor.mailbox_depth);

        let registrar = TriggersPlugin::new();
        let leaves = hub_plugins::builtin();
        let builtin = leaves.iter().map(|p| p.name().to_string()).collect();
        let loader = hub_automation::plugins(&registrar)
            .into_iter()
            .chain(leaves)
            .fold(StaticLoader::new(), |loader, plugin| loader.with_instance(plugin));
        let registry = Arc::new(Registry::new());
        registry.register_from(&loader)?;

        let manager = Arc::new(PluginManager::new(registry, service.clone(), config.plugins.clone()));
        if let Some(dir) = config.plugins_dir(config_dir) {
            debug!(directory = %dir.display(), "External plugins enabled");
            manager.add_loader(Arc::new(ProcessPluginLoader::new(dir)));
        }

        let supervisor = Supervisor::new(manager.clone(), config.supervisor.clone());
        let triggers = TriggerManager::new(registrar, service, config.automation.clone());
        let tasks = TaskManager::new(supervisor.clone(), config.automation.clone());
        Ok(Self {
            bus,
            repos,
            manager,
            supervisor,
            triggers,
            tasks,
            builtin,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await?;
        self.enable_builtin().await?;
        self.triggers.start().await?;
        self.tasks.start().await?;

        self.bus
            .publish(
                topics::service(SERVICE),
                Event::ServiceStarted {
                    service: SERVICE.to_string(),
                },
            )
            .await;
        info!("Hub is running");
        Ok(())
    }

    /// Built-in leaf plugins start enabled until someone disables them
    async fn enable_builtin(&self) -> Result<()> {
        for name in &self.builtin {
            match self.repos.plugins.get_by_id(name).await {
                Ok(_) => {}
                Err(StorageError::NotFound { .. }) => {
                    if let Err(err) = self.manager.enable_plugin(name).await {
                        warn!(plugin = %name, error = %err, "Built-in plugin not enabled");
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Stop automation first, then the supervisor and its plugins
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.triggers.shutdown().await;
        self.supervisor.shutdown().await;

        self.bus
            .publish(
                topics::service(SERVICE),
                Event::ServiceStopped {
                    service: SERVICE.to_string(),
                },
            )
            .await;
        info!("Hub stopped");
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = HubConfig::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    init_tracing(&config.logger.level);

    info!(config_dir = %config_dir.display(), "Starting hub");
    let hub = Hub::new(&config, &config_dir).await?;
    hub.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    hub.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::models::Entity;
    use hub_core::EntityId;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig::default();
        let hub = Hub::new(&config, dir.path()).await.unwrap();
        hub.start().await.unwrap();

        for name in ["triggers", "state_change", "system", "sensor"] {
            assert!(hub.manager.is_loaded(name).await, "{name} not loaded");
        }
        let id: EntityId = "sensor.porch".parse().unwrap();
        hub.supervisor.add_entity(Entity::new(id.clone())).await.unwrap();
        assert!(hub.supervisor.entity_is_loaded(&id).await);

        hub.shutdown().await;
        assert_eq!(hub.manager.loaded_count(), 0);
        assert!(dir.path().join(".storage").exists());
    }

    #[tokio::test]
    async fn test_disabled_builtin_stays_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig::default();

        let hub = Hub::new(&config, dir.path()).await.unwrap();
        hub.start().await.unwrap();
        hub.manager.disable_plugin("sensor").await.unwrap();
        hub.shutdown().await;

        let hub = Hub::new(&config, dir.path()).await.unwrap();
        hub.start().await.unwrap();
        assert!(!hub.manager.is_loaded("sensor").await);
        assert!(hub.manager.is_loaded("triggers").await);
        hub.shutdown().await;
    }
}

//! Plugin Manager
//!
//! Owns the lifecycle of every plugin: load, unload, install and uninstall,
//! the paged startup and the drain on shutdown.
//!
//! The state map is the single authority on whether a plugin is loaded.
//! Actor operations hold its read lock for their whole duration, so an
//! unload can never interleave with an actor being added to the same plugin.

use futures::future::join_all;
use hub_config::PluginsConfig;
use hub_core::models::{Entity, PluginInfo, PluginKind, PluginRecord};
use hub_core::{topics, EntityId, Event, HubError, HubResult, ValidationErrors};
use hub_storage::{ListQuery, StorageError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::actor::SharedActor;
use crate::plugin::{PluginService, SharedPlugin};
use crate::registry::{PluginLoader, SharedRegistry};
use crate::state_machine::{InvalidTransition, PluginState};

pub struct PluginManager {
    registry: SharedRegistry,
    service: PluginService,
    config: PluginsConfig,
    loaders: Mutex<Vec<Arc<dyn PluginLoader>>>,
    instances: dashmap::DashMap<String, SharedPlugin>,
    states: RwLock<HashMap<String, PluginState>>,
    /// Loaded plugins not yet unloaded
    outstanding: AtomicUsize,
    drained: Notify,
}

impl PluginManager {
    pub fn new(registry: SharedRegistry, service: PluginService, config: PluginsConfig) -> Self {
        Self {
            registry,
            service,
            config,
            loaders: Mutex::new(Vec::new()),
            instances: dashmap::DashMap::new(),
            states: RwLock::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Loader run by [`PluginManager::start`]
    pub fn add_loader(&self, loader: Arc<dyn PluginLoader>) {
        self.loaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(loader);
    }

    pub fn service(&self) -> &PluginService {
        &self.service
    }

    /// The one instance of `name`, created on first use
    pub fn plugin(&self, name: &str) -> HubResult<SharedPlugin> {
        if let Some(plugin) = self.instances.get(name) {
            return Ok(plugin.value().clone());
        }
        let plugin = self.registry.create(name)?;
        Ok(self
            .instances
            .entry(name.to_string())
            .or_insert(plugin)
            .value()
            .clone())
    }

    async fn transition(&self, name: &str, to: PluginState) -> Result<PluginState, InvalidTransition> {
        let mut states = self.states.write().await;
        let from = states.get(name).copied().unwrap_or_default();
        let next = from.try_transition(to)?;
        states.insert(name.to_string(), next);
        Ok(from)
    }

    pub async fn state(&self, name: &str) -> PluginState {
        self.states.read().await.get(name).copied().unwrap_or_default()
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.state(name).await.is_loaded()
    }

    pub fn loaded_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub async fn loaded_names(&self) -> HashSet<String> {
        self.states
            .read()
            .await
            .iter()
            .filter(|(_, state)| state.is_loaded())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Load one plugin; its dependencies must already be loaded
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> HubResult<()> {
        let plugin = self.plugin(name)?;
        for dep in plugin.depends() {
            if !self.is_loaded(&dep).await {
                warn!(plugin = %name, dependency = %dep, "Dependency not loaded");
                return Err(HubError::PluginNotLoaded(dep));
            }
        }

        self.transition(name, PluginState::Loading)
            .await
            .map_err(|_| HubError::AlreadyLoaded(name.to_string()))?;

        if let Err(err) = plugin.load(self.service.clone()).await {
            warn!(plugin = %name, error = %err, "Plugin failed to load");
            if let Err(t) = self.transition(name, PluginState::NotLoaded).await {
                warn!(plugin = %name, error = %t, "Unexpected plugin state");
            }
            return Err(err);
        }

        self.transition(name, PluginState::Loaded)
            .await
            .map_err(HubError::internal)?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        info!(plugin = %name, version = plugin.version(), "Plugin loaded");
        self.service
            .bus
            .publish(
                topics::plugin(name),
                Event::PluginLoaded {
                    plugin_name: name.to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// Unload one plugin; an unload error is logged and the plugin still ends up unloaded
    #[instrument(skip(self))]
    pub async fn unload(&self, name: &str) -> HubResult<()> {
        self.transition(name, PluginState::Unloading)
            .await
            .map_err(|_| HubError::PluginNotLoaded(name.to_string()))?;

        let plugin = self.plugin(name)?;
        if let Err(err) = plugin.unload().await {
            warn!(plugin = %name, error = %err, "Plugin unload reported an error");
        }

        self.transition(name, PluginState::NotLoaded)
            .await
            .map_err(HubError::internal)?;
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            self.drained.notify_waiters();
        }

        info!(plugin = %name, "Plugin unloaded");
        self.service
            .bus
            .publish(
                topics::plugin(name),
                Event::PluginUnloaded {
                    plugin_name: name.to_string(),
                },
            )
            .await;
        Ok(())
    }

    fn installable(&self, plugin: &SharedPlugin) -> HubResult<()> {
        if plugin.kind() == PluginKind::Installable {
            return Ok(());
        }
        let mut errors = ValidationErrors::new();
        errors.add("name", format!("plugin {} is not installable", plugin.name()));
        Err(errors.into())
    }

    fn record_for(plugin: &SharedPlugin, enabled: bool) -> PluginRecord {
        let mut record = PluginRecord::new(plugin.name(), plugin.version());
        record.enabled = enabled;
        record.system = plugin.kind() == PluginKind::System;
        record.external = plugin.kind() == PluginKind::Installable;
        record.options = plugin.options();
        record.depends = plugin.depends();
        record
    }

    async fn persist_enabled(&self, plugin: &SharedPlugin, enabled: bool) -> HubResult<()> {
        let record = match self.service.repos.plugins.get_by_id(&plugin.name().to_string()).await {
            Ok(mut record) => {
                record.enabled = enabled;
                record
            }
            Err(StorageError::NotFound { .. }) => Self::record_for(plugin, enabled),
            Err(err) => return Err(err.into()),
        };
        self.service.repos.plugins.upsert(record).await?;
        Ok(())
    }

    /// Run the plugin's install hook, persist it enabled and load it
    #[instrument(skip(self))]
    pub async fn install(&self, name: &str) -> HubResult<()> {
        let plugin = self.plugin(name)?;
        self.installable(&plugin)?;
        if let Ok(record) = self.service.repos.plugins.get_by_id(&name.to_string()).await {
            if record.enabled {
                debug!(plugin = %name, "Plugin already installed");
                return Ok(());
            }
        }
        plugin.install().await?;
        self.persist_enabled(&plugin, true).await?;
        self.load(name).await
    }

    #[instrument(skip(self))]
    pub async fn uninstall(&self, name: &str) -> HubResult<()> {
        let plugin = self.plugin(name)?;
        self.installable(&plugin)?;
        if self.is_loaded(name).await {
            self.unload(name).await?;
        }
        plugin.uninstall().await?;
        self.persist_enabled(&plugin, false).await
    }

    /// Load and remember to load on the next start
    pub async fn enable_plugin(&self, name: &str) -> HubResult<()> {
        let plugin = self.plugin(name)?;
        self.load(name).await?;
        self.persist_enabled(&plugin, true).await
    }

    pub async fn disable_plugin(&self, name: &str) -> HubResult<()> {
        let plugin = self.plugin(name)?;
        self.unload(name).await?;
        self.persist_enabled(&plugin, false).await
    }

    pub async fn plugin_info(&self, name: &str) -> HubResult<PluginInfo> {
        let plugin = self.plugin(name)?;
        let enabled = match self.service.repos.plugins.get_by_id(&name.to_string()).await {
            Ok(record) => record.enabled,
            Err(StorageError::NotFound { .. }) => false,
            Err(err) => return Err(err.into()),
        };
        Ok(PluginInfo {
            name: name.to_string(),
            version: plugin.version().to_string(),
            kind: plugin.kind(),
            loaded: self.is_loaded(name).await,
            enabled,
            system: plugin.kind() == PluginKind::System,
            depends: plugin.depends(),
            options: plugin.options(),
        })
    }

    /// Every registered plugin, sorted by name
    pub async fn plugin_list(&self) -> HubResult<Vec<PluginInfo>> {
        let mut list = Vec::new();
        for name in self.registry.names() {
            list.push(self.plugin_info(&name).await?);
        }
        Ok(list)
    }

    async fn seed_system(&self) -> HubResult<()> {
        for name in self.registry.names() {
            let plugin = self.plugin(&name)?;
            if plugin.kind() != PluginKind::System {
                continue;
            }
            match self.service.repos.plugins.get_by_id(&name).await {
                Ok(_) => {}
                Err(StorageError::NotFound { .. }) => {
                    debug!(plugin = %name, "Seeding system plugin record");
                    self.service
                        .repos
                        .plugins
                        .add(Self::record_for(&plugin, true))
                        .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn enabled_plugins(&self) -> HubResult<Vec<String>> {
        let mut names = Vec::new();
        let mut query = ListQuery::new(self.config.page_size.max(1), 0).only_enabled();
        loop {
            let page = self.service.repos.plugins.list(&query).await?;
            let more = page.has_more(&query);
            names.extend(page.items.into_iter().map(|r| r.name));
            if !more {
                break;
            }
            query = query.next_page();
        }
        Ok(names)
    }

    /// Discover external plugins and load every enabled one
    ///
    /// Plugins load in dependency order; those within one wave load
    /// concurrently. Unknown plugins and unsatisfiable dependencies are
    /// skipped with a warning.
    #[instrument(skip(self))]
    pub async fn start(&self) -> HubResult<()> {
        let loaders: Vec<Arc<dyn PluginLoader>> = self
            .loaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for loader in loaders {
            if let Err(err) = self.registry.register_from(loader.as_ref()) {
                warn!(loader = loader.name(), error = %err, "Plugin loader failed");
            }
        }

        if self.config.seed_system {
            self.seed_system().await?;
        }

        let mut wanted = BTreeMap::new();
        for name in self.enabled_plugins().await? {
            match self.plugin(&name) {
                Ok(plugin) => {
                    wanted.insert(name, plugin.depends());
                }
                Err(err) => warn!(plugin = %name, error = %err, "Enabled plugin is not registered"),
            }
        }

        let (waves, skipped) = plan_waves(&wanted, &self.loaded_names().await);
        for (name, reason) in skipped {
            warn!(plugin = %name, reason, "Plugin skipped");
        }
        for wave in waves {
            let results = join_all(wave.iter().map(|name| self.load(name))).await;
            for (name, result) in wave.iter().zip(results) {
                if let Err(err) = result {
                    warn!(plugin = %name, error = %err, "Plugin not started");
                }
            }
        }

        info!(loaded = self.loaded_count(), "Plugin manager started");
        Ok(())
    }

    /// Unload everything, dependents first, then wait for the drain
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let loaded = self.loaded_names().await;
        let mut wanted = BTreeMap::new();
        for name in &loaded {
            if let Ok(plugin) = self.plugin(name) {
                let deps = plugin
                    .depends()
                    .into_iter()
                    .filter(|d| loaded.contains(d))
                    .collect();
                wanted.insert(name.clone(), deps);
            }
        }
        let (waves, leftover) = plan_waves(&wanted, &HashSet::new());
        let mut order: Vec<Vec<String>> = waves.into_iter().rev().collect();
        if !leftover.is_empty() {
            order.push(leftover.into_iter().map(|(name, _)| name).collect());
        }

        for wave in order {
            let results = join_all(wave.iter().map(|name| self.unload(name))).await;
            for (name, result) in wave.iter().zip(results) {
                if let Err(err) = result {
                    debug!(plugin = %name, error = %err, "Unload skipped");
                }
            }
        }
        self.wait_drained().await;
        info!("Plugin manager stopped");
    }

    /// Resolve once no plugin is loaded
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Create or update the actor for `entity` in its plugin
    pub async fn add_or_update_actor(&self, entity: Entity) -> HubResult<()> {
        let name = entity.plugin_name().to_string();
        let states = self.states.read().await;
        if !states.get(&name).copied().unwrap_or_default().is_loaded() {
            return Err(HubError::PluginNotLoaded(name));
        }
        let plugin = self.plugin(&name)?;
        plugin.add_or_update_actor(entity).await?;
        drop(states);
        Ok(())
    }

    pub async fn remove_actor(&self, entity_id: &EntityId) -> HubResult<()> {
        let name = entity_id.plugin_name();
        let states = self.states.read().await;
        if !states.get(name).copied().unwrap_or_default().is_loaded() {
            return Err(HubError::PluginNotLoaded(name.to_string()));
        }
        let plugin = self.plugin(name)?;
        plugin.remove_actor(entity_id).await?;
        drop(states);
        Ok(())
    }

    pub async fn get_actor(&self, entity_id: &EntityId) -> HubResult<SharedActor> {
        let name = entity_id.plugin_name();
        let states = self.states.read().await;
        if !states.get(name).copied().unwrap_or_default().is_loaded() {
            return Err(HubError::PluginNotLoaded(name.to_string()));
        }
        self.plugin(name)?.get_actor(entity_id)
    }

    /// Actors of every loaded plugin
    pub async fn loaded_actors(&self) -> Vec<SharedActor> {
        let states = self.states.read().await;
        let mut actors = Vec::new();
        for (name, state) in states.iter() {
            if !state.is_loaded() {
                continue;
            }
            let Ok(plugin) = self.plugin(name) else {
                continue;
            };
            actors.extend(
                plugin
                    .actor_ids()
                    .iter()
                    .filter_map(|id| plugin.get_actor(id).ok()),
            );
        }
        actors
    }
}

pub type SharedPluginManager = Arc<PluginManager>;

/// Order `wanted` (name to dependencies) into load waves
///
/// Names in `already` count as satisfied. Returns the waves and the names
/// that can never load, with the reason.
pub fn plan_waves(
    wanted: &BTreeMap<String, Vec<String>>,
    already: &HashSet<String>,
) -> (Vec<Vec<String>>, Vec<(String, &'static str)>) {
    let mut done = already.clone();
    let mut pending = wanted.clone();
    let mut skipped = Vec::new();

    loop {
        let missing: Vec<String> = pending
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| !done.contains(d) && !pending.contains_key(d)))
            .map(|(name, _)| name.clone())
            .collect();
        if missing.is_empty() {
            break;
        }
        for name in missing {
            pending.remove(&name);
            skipped.push((name, "dependency not available"));
        }
    }

    let mut waves = Vec::new();
    while !pending.is_empty() {
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| done.contains(d)))
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            skipped.extend(pending.keys().map(|name| (name.clone(), "dependency cycle")));
            break;
        }
        for name in &ready {
            pending.remove(name);
            done.insert(name.clone());
        }
        waves.push(ready);
    }
    (waves, skipped)
}

//! Name to plugin factory lookup
//!
//! Built-in plugins come from an explicit initialization list, external
//! ones from [`PluginLoader`]s run at startup.

use dashmap::DashMap;
use hub_core::{HubError, HubResult};
use std::sync::Arc;
use tracing::{debug, info};

use crate::plugin::SharedPlugin;

pub type PluginFactory = Arc<dyn Fn() -> SharedPlugin + Send + Sync>;

/// Source of plugin factories, e.g. a directory of manifests
pub trait PluginLoader: Send + Sync {
    fn name(&self) -> &str;

    fn discover(&self) -> HubResult<Vec<(String, PluginFactory)>>;
}

/// Fixed list of compiled-in plugins
#[derive(Default)]
pub struct StaticLoader {
    plugins: Vec<(String, PluginFactory)>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> SharedPlugin + Send + Sync + 'static,
    {
        self.plugins.push((name.into(), Arc::new(factory)));
        self
    }

    /// Register an already built instance
    pub fn with_instance(self, plugin: SharedPlugin) -> Self {
        let name = plugin.name().to_string();
        self.with(name, move || plugin.clone())
    }
}

impl PluginLoader for StaticLoader {
    fn name(&self) -> &str {
        "builtin"
    }

    fn discover(&self) -> HubResult<Vec<(String, PluginFactory)>> {
        Ok(self.plugins.clone())
    }
}

#[derive(Default)]
pub struct Registry {
    factories: DashMap<String, PluginFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: PluginFactory) -> HubResult<()> {
        let name = name.into();
        match self.factories.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(HubError::already_exists("plugin", name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(plugin = %name, "Registered plugin factory");
                slot.insert(factory);
                Ok(())
            }
        }
    }

    /// Register everything `loader` discovers, returning how many were new
    pub fn register_from(&self, loader: &dyn PluginLoader) -> HubResult<usize> {
        let mut count = 0;
        for (name, factory) in loader.discover()? {
            match self.register(name.clone(), factory) {
                Ok(()) => count += 1,
                Err(err) => debug!(plugin = %name, loader = loader.name(), error = %err, "Skipping plugin"),
            }
        }
        info!(loader = loader.name(), count, "Plugins discovered");
        Ok(count)
    }

    pub fn create(&self, name: &str) -> HubResult<SharedPlugin> {
        let factory = self
            .factories
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| HubError::not_found("plugin", name))?;
        Ok(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }
}

pub type SharedRegistry = Arc<Registry>;

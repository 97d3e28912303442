//! The plugin contract

use async_trait::async_trait;
use hub_core::models::{Entity, PluginKind, PluginOptions};
use hub_core::{EntityId, HubError, HubResult};
use hub_event_bus::SharedEventBus;
use hub_script::ScriptService;
use hub_storage::Repositories;
use std::sync::Arc;

use crate::actor::{ActorSet, SharedActor};

/// What a plugin receives when it is loaded
#[derive(Clone)]
pub struct PluginService {
    pub bus: SharedEventBus,
    pub repos: Repositories,
    pub scripts: ScriptService,
    /// Capacity of every actor mailbox
    pub mailbox_depth: usize,
}

impl PluginService {
    pub fn new(bus: SharedEventBus, repos: Repositories, scripts: ScriptService) -> Self {
        Self {
            bus,
            repos,
            scripts,
            mailbox_depth: hub_core::DEFAULT_MAILBOX_DEPTH,
        }
    }

    pub fn with_mailbox_depth(mut self, depth: usize) -> Self {
        self.mailbox_depth = depth;
        self
    }
}

/// A unit of functionality the plugin manager loads and unloads
///
/// Plugins that own actors return their [`ActorSet`] from [`Plugin::actors`]
/// and get the actor operations for free.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::BuiltIn
    }

    /// Plugins that must be loaded first
    fn depends(&self) -> Vec<String> {
        Vec::new()
    }

    fn options(&self) -> PluginOptions {
        PluginOptions::default()
    }

    /// Start the plugin. Called once per load cycle.
    async fn load(&self, service: PluginService) -> HubResult<()>;

    /// Stop everything the plugin started before returning
    async fn unload(&self) -> HubResult<()>;

    async fn install(&self) -> HubResult<()> {
        Ok(())
    }

    async fn uninstall(&self) -> HubResult<()> {
        Ok(())
    }

    fn actors(&self) -> Option<&ActorSet> {
        None
    }

    async fn add_or_update_actor(&self, entity: Entity) -> HubResult<()> {
        match self.actors() {
            Some(actors) => actors.add_or_update(entity).await.map(|_| ()),
            None => Err(HubError::Internal(format!(
                "plugin {} does not manage actors",
                self.name()
            ))),
        }
    }

    async fn remove_actor(&self, entity_id: &EntityId) -> HubResult<()> {
        match self.actors() {
            Some(actors) => actors.remove(entity_id).await,
            None => Err(HubError::not_found("actor", entity_id)),
        }
    }

    fn get_actor(&self, entity_id: &EntityId) -> HubResult<SharedActor> {
        match self.actors() {
            Some(actors) => actors.get(entity_id),
            None => Err(HubError::not_found("actor", entity_id)),
        }
    }

    fn entity_is_loaded(&self, entity_id: &EntityId) -> bool {
        self.actors().map_or(false, |actors| actors.contains(entity_id))
    }

    fn actor_ids(&self) -> Vec<EntityId> {
        self.actors().map(ActorSet::ids).unwrap_or_default()
    }
}

pub type SharedPlugin = Arc<dyn Plugin>;

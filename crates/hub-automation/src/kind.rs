//! Trigger kinds and the `triggers` plugin that hosts them
//!
//! A trigger kind decides when a trigger fires. Kinds are contributed by
//! plugins that depend on `triggers` and register themselves while they are
//! loaded.

use async_trait::async_trait;
use dashmap::DashMap;
use hub_core::models::PluginKind;
use hub_core::{EntityId, HubError, HubResult};
use hub_supervisor::{Plugin, PluginService};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the plugin hosting the registrar
pub const TRIGGERS_PLUGIN: &str = "triggers";

/// What a kind hands to a trigger when it fires
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FireMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    pub payload: Value,
}

pub type FireHandler = Arc<dyn Fn(FireMessage) + Send + Sync>;

/// One running trigger as a kind sees it
#[derive(Clone)]
pub struct Subscriber {
    pub trigger_id: i64,
    /// Entities the trigger observes; empty means any
    pub entity_ids: Vec<EntityId>,
    /// Kind specific options from the trigger record
    pub payload: Value,
    pub handler: FireHandler,
}

impl Subscriber {
    pub fn observes(&self, entity_id: &EntityId) -> bool {
        self.entity_ids.is_empty() || self.entity_ids.contains(entity_id)
    }

    pub fn fire(&self, message: FireMessage) {
        (self.handler)(message)
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("trigger_id", &self.trigger_id)
            .field("entity_ids", &self.entity_ids)
            .finish()
    }
}

pub trait TriggerKind: Send + Sync + 'static {
    /// Matches `Trigger::plugin_name`
    fn name(&self) -> &str;

    /// Script macro asked whether a fire should complete
    fn function_name(&self) -> &str;

    fn subscribe(&self, subscriber: Subscriber);

    fn unsubscribe(&self, trigger_id: i64);
}

pub type SharedTriggerKind = Arc<dyn TriggerKind>;

/// Subscriber bookkeeping shared by the built-in kinds
#[derive(Default)]
pub struct Subscribers(DashMap<i64, Subscriber>);

impl Subscribers {
    pub fn insert(&self, subscriber: Subscriber) {
        self.0.insert(subscriber.trigger_id, subscriber);
    }

    pub fn remove(&self, trigger_id: i64) {
        self.0.remove(&trigger_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&self) {
        self.0.clear();
    }

    /// Snapshot, so handlers run without holding shard locks
    pub fn matching(&self, pred: impl Fn(&Subscriber) -> bool) -> Vec<Subscriber> {
        self.0
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// The `triggers` system plugin
pub struct TriggersPlugin {
    kinds: DashMap<String, SharedTriggerKind>,
    loaded: AtomicBool,
}

impl TriggersPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kinds: DashMap::new(),
            loaded: AtomicBool::new(false),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn register(&self, kind: SharedTriggerKind) -> HubResult<()> {
        if !self.is_loaded() {
            return Err(HubError::PluginNotLoaded(TRIGGERS_PLUGIN.to_string()));
        }
        let name = kind.name().to_string();
        match self.kinds.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HubError::already_exists("trigger kind", name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(kind);
                debug!(kind = %name, "Trigger kind registered");
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) {
        if self.kinds.remove(name).is_some() {
            debug!(kind = name, "Trigger kind unregistered");
        }
    }

    /// Kind named `name`; a missing kind means its plugin is not loaded
    pub fn kind(&self, name: &str) -> HubResult<SharedTriggerKind> {
        if !self.is_loaded() {
            return Err(HubError::PluginNotLoaded(TRIGGERS_PLUGIN.to_string()));
        }
        self.kinds
            .get(name)
            .map(|kind| kind.value().clone())
            .ok_or_else(|| HubError::PluginNotLoaded(name.to_string()))
    }

    pub fn kind_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.iter().map(|k| k.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Plugin for TriggersPlugin {
    fn name(&self) -> &str {
        TRIGGERS_PLUGIN
    }

    fn kind(&self) -> PluginKind {
        PluginKind::System
    }

    async fn load(&self, _service: PluginService) -> HubResult<()> {
        self.loaded.store(true, Ordering::SeqCst);
        info!("Trigger registrar ready");
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        self.loaded.store(false, Ordering::SeqCst);
        self.kinds.clear();
        Ok(())
    }
}

//! Entity actors
//!
//! An actor is the live counterpart of an [`Entity`] record. Commands reach
//! it through a bounded bus mailbox on `system/entities/<id>` and are
//! handled one at a time, in arrival order, by a single consumer task. When
//! the mailbox is full, publishers wait.
//!
//! State only changes through [`Actor::set_state`], which the supervisor
//! calls after resolving the actor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use hub_core::models::{AttributeValues, Entity, EntityState};
use hub_core::{topics, EntityId, Event, HubError, HubResult, StateParams, StateSnapshot, ValidationErrors};
use hub_event_bus::{EventFilter, Mailbox, SharedEventBus, SubscriptionId};
use hub_script::{call_blocking_holding, SharedEngine};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::plugin::PluginService;

/// Script function run for `CallEntityAction`
pub const ENTITY_ACTION_FN: &str = "entityAction";
/// Script function run for `CallScene`
pub const ENTITY_SCENE_FN: &str = "entityScene";

pub type SharedActor = Arc<Actor>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Executes the commands an actor receives
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()>;

    async fn call_scene(&self, actor: &Actor, args: Value) -> HubResult<()>;
}

/// Default handler: runs the entity's scripts
pub struct ScriptActions;

#[async_trait]
impl ActionHandler for ScriptActions {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()> {
        let engine = actor
            .action_engine(action)
            .ok_or_else(|| HubError::not_found("action script", format!("{}:{action}", actor.id())))?;
        let slot = actor.script_slot().await?;
        let output = call_blocking_holding(
            engine,
            ENTITY_ACTION_FN,
            vec![json!(actor.id().to_string()), json!(action), args],
            slot,
        )
        .await?;
        trace!(entity_id = %actor.id(), action, output = %output, "Action script finished");
        Ok(())
    }

    async fn call_scene(&self, actor: &Actor, args: Value) -> HubResult<()> {
        let engine = actor
            .entity_engine()
            .ok_or_else(|| HubError::not_found("scene script", actor.id()))?;
        let slot = actor.script_slot().await?;
        call_blocking_holding(engine, ENTITY_SCENE_FN, vec![json!(actor.id().to_string()), args], slot).await?;
        Ok(())
    }
}

/// Compiled scripts of one actor
#[derive(Default)]
pub struct ActorEngines {
    entity: Vec<SharedEngine>,
    actions: HashMap<String, SharedEngine>,
}

impl ActorEngines {
    /// Compile every script `entity` references; broken ones are skipped
    pub async fn build(entity: &Entity, service: &PluginService) -> Self {
        let mut engines = Self::default();
        for script_id in &entity.script_ids {
            if let Some(engine) = compile(entity, *script_id, service).await {
                engines.entity.push(engine);
            }
        }
        for action in &entity.actions {
            if let Some(script_id) = action.script_id {
                if let Some(engine) = compile(entity, script_id, service).await {
                    engines.actions.insert(action.name.clone(), engine);
                }
            }
        }
        engines
    }

    pub fn is_empty(&self) -> bool {
        self.entity.is_empty() && self.actions.is_empty()
    }
}

async fn compile(entity: &Entity, script_id: i64, service: &PluginService) -> Option<SharedEngine> {
    let script = match service.repos.scripts.get_by_id(&script_id).await {
        Ok(script) => script,
        Err(err) => {
            warn!(entity_id = %entity.id, script_id, error = %err, "Actor script missing");
            return None;
        }
    };
    let engine = match service.scripts.new_engine(&script) {
        Ok(engine) => engine,
        Err(err) => {
            warn!(entity_id = %entity.id, script_id, error = %err, "Actor script does not compile");
            return None;
        }
    };
    if let Err(err) = engine.push_struct("ENTITY_ID", json!(entity.id.to_string())) {
        warn!(entity_id = %entity.id, script_id, error = %err, "Could not expose entity id");
    }
    Some(engine)
}

struct ActorInner {
    /// Record plus live attribute and settings values
    entity: Entity,
    state: Option<EntityState>,
    last_changed: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
    previous: StateSnapshot,
}

impl ActorInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state.clone(),
            attributes: self.entity.attributes.values(),
            settings: self.entity.settings.values(),
            last_changed: self.last_changed,
            last_updated: self.last_updated,
        }
    }
}

/// Result of a successful state mutation
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub old: StateSnapshot,
    pub new: StateSnapshot,
    pub changed: bool,
}

pub struct Actor {
    id: EntityId,
    inner: RwLock<ActorInner>,
    engines: RwLock<Arc<ActorEngines>>,
    handler: Arc<dyn ActionHandler>,
    bus: SharedEventBus,
    mailbox_topic: String,
    mailbox_id: SubscriptionId,
    consumer: Mutex<Option<JoinHandle<()>>>,
    /// Held by a script running on a blocking thread for this actor
    scripts: Arc<Semaphore>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Actor {
    /// Subscribe the mailbox and start the consumer
    pub fn spawn(
        entity: Entity,
        engines: ActorEngines,
        service: &PluginService,
        handler: Arc<dyn ActionHandler>,
    ) -> HubResult<SharedActor> {
        let id = entity.id.clone();
        let topic = topics::entity(&id);
        let filter: EventFilter = Arc::new(Event::is_actor_command);
        let mailbox = service
            .bus
            .subscribe_mailbox(&topic, service.mailbox_depth, Some(filter))
            .map_err(HubError::internal)?;

        let actor = Arc::new(Actor {
            id: id.clone(),
            inner: RwLock::new(ActorInner {
                entity,
                state: None,
                last_changed: None,
                last_updated: None,
                previous: StateSnapshot::default(),
            }),
            engines: RwLock::new(Arc::new(engines)),
            handler,
            bus: service.bus.clone(),
            mailbox_topic: topic,
            mailbox_id: mailbox.id(),
            consumer: Mutex::new(None),
            scripts: Arc::new(Semaphore::new(1)),
        });

        let handle = tokio::spawn(consume(Arc::downgrade(&actor), mailbox));
        *actor.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(entity_id = %id, depth = service.mailbox_depth, "Actor started");
        Ok(actor)
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        self.id.plugin_name()
    }

    pub fn entity(&self) -> Entity {
        read(&self.inner).entity.clone()
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn area_id(&self) -> Option<i64> {
        read(&self.inner).entity.area_id
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        read(&self.inner).entity.tags.iter().any(|t| t == tag)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        read(&self.inner).snapshot()
    }

    /// Snapshot taken right before the latest mutation
    pub fn previous(&self) -> StateSnapshot {
        read(&self.inner).previous.clone()
    }

    pub fn state_name(&self) -> Option<String> {
        read(&self.inner).state.as_ref().map(|s| s.name.clone())
    }

    pub fn attributes(&self) -> AttributeValues {
        read(&self.inner).entity.attributes.values()
    }

    pub fn settings(&self) -> AttributeValues {
        read(&self.inner).entity.settings.values()
    }

    /// Script for `action`, falling back to the first entity script
    pub fn action_engine(&self, action: &str) -> Option<SharedEngine> {
        let engines = read(&self.engines).clone();
        engines
            .actions
            .get(action)
            .cloned()
            .or_else(|| engines.entity.first().cloned())
    }

    pub fn entity_engine(&self) -> Option<SharedEngine> {
        read(&self.engines).entity.first().cloned()
    }

    /// Apply a mutation
    ///
    /// A state name must be one the entity declares, unless it declares
    /// none. Attribute and settings values go through the typed schema;
    /// rejected names are logged and skipped.
    pub fn set_state(&self, params: &StateParams) -> HubResult<StateChange> {
        let mut inner = write(&self.inner);
        let old = inner.snapshot();
        let mut changed = false;

        if let Some(name) = &params.new_state {
            let state = if inner.entity.states.is_empty() {
                EntityState::new(name.clone())
            } else {
                match inner.entity.states.iter().find(|s| &s.name == name) {
                    Some(state) => state.clone(),
                    None => {
                        let mut errors = ValidationErrors::new();
                        errors.add("new_state", format!("unknown state {name}"));
                        return Err(errors.into());
                    }
                }
            };
            if inner.state.as_ref() != Some(&state) {
                inner.state = Some(state);
                changed = true;
            }
        }

        let attrs = inner.entity.attributes.merge(&params.attribute_values);
        if !attrs.rejected.is_empty() {
            warn!(entity_id = %self.id, rejected = ?attrs.rejected, "Attributes rejected");
        }
        let settings = inner.entity.settings.merge(&params.settings_value);
        if !settings.rejected.is_empty() {
            warn!(entity_id = %self.id, rejected = ?settings.rejected, "Settings rejected");
        }
        changed |= attrs.changed || settings.changed;

        let now = Utc::now();
        inner.last_updated = Some(now);
        if changed || inner.last_changed.is_none() {
            inner.last_changed = Some(now);
        }
        inner.previous = old.clone();

        Ok(StateChange {
            old,
            new: inner.snapshot(),
            changed,
        })
    }

    /// Swap in a new record and scripts, keeping live values
    pub fn update(&self, mut entity: Entity, engines: ActorEngines) {
        {
            let mut inner = write(&self.inner);
            let _ = entity.attributes.merge(&inner.entity.attributes.values());
            let _ = entity.settings.merge(&inner.entity.settings.values());
            if let Some(current) = inner.state.as_ref() {
                if !entity.states.is_empty() && !entity.states.iter().any(|s| s.name == current.name) {
                    inner.state = None;
                }
            }
            inner.entity = entity;
        }
        *write(&self.engines) = Arc::new(engines);
        debug!(entity_id = %self.id, "Actor updated");
    }

    /// Permit a handler passes along with a blocking script run
    ///
    /// Fails once the actor is stopped.
    pub async fn script_slot(&self) -> HubResult<OwnedSemaphorePermit> {
        self.scripts
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HubError::internal(format!("actor {} is stopped", self.id)))
    }

    /// Unsubscribe the mailbox, cancel the command in flight and wait for
    /// a script still running on a blocking thread
    pub async fn stop(&self) {
        if let Err(err) = self.bus.unsubscribe(&self.mailbox_topic, self.mailbox_id) {
            trace!(entity_id = %self.id, error = %err, "Mailbox already gone");
        }
        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if let Ok(permit) = self.scripts.acquire().await {
            permit.forget();
        }
        self.scripts.close();
        debug!(entity_id = %self.id, "Actor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }
}

async fn consume(actor: Weak<Actor>, mut mailbox: Mailbox) {
    while let Some((_, event)) = mailbox.recv().await {
        let Some(actor) = actor.upgrade() else {
            break;
        };
        let id = actor.id.clone();
        let kind = event.kind();
        // inline, so aborting the consumer cancels the command; a panic costs only that command
        match AssertUnwindSafe(dispatch(actor, event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(entity_id = %id, event = kind, error = %err, "Actor command failed"),
            Err(_) => error!(entity_id = %id, event = kind, "Actor command panicked"),
        }
    }
}

async fn dispatch(actor: SharedActor, event: Event) -> HubResult<()> {
    let handler = actor.handler.clone();
    match event {
        Event::CallEntityAction {
            action_name, args, ..
        } => handler.call_action(&actor, &action_name, args).await,
        Event::CallScene { args, .. } => handler.call_scene(&actor, args).await,
        _ => Ok(()),
    }
}

/// The actors of one plugin
pub struct ActorSet {
    plugin: String,
    actors: DashMap<EntityId, SharedActor>,
    service: RwLock<Option<PluginService>>,
    handler: Arc<dyn ActionHandler>,
    change_lock: tokio::sync::Mutex<()>,
}

impl ActorSet {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self::with_handler(plugin, Arc::new(ScriptActions))
    }

    pub fn with_handler(plugin: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            plugin: plugin.into(),
            actors: DashMap::new(),
            service: RwLock::new(None),
            handler,
            change_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Called from the plugin's load
    pub fn bind(&self, service: PluginService) {
        *write(&self.service) = Some(service);
    }

    fn service(&self) -> HubResult<PluginService> {
        read(&self.service)
            .clone()
            .ok_or_else(|| HubError::PluginNotLoaded(self.plugin.clone()))
    }

    pub async fn add_or_update(&self, entity: Entity) -> HubResult<SharedActor> {
        if entity.plugin_name() != self.plugin {
            let mut errors = ValidationErrors::new();
            errors.add("entity_id", format!("entity does not belong to plugin {}", self.plugin));
            return Err(errors.into());
        }
        let service = self.service()?;
        let _guard = self.change_lock.lock().await;
        let engines = ActorEngines::build(&entity, &service).await;

        if let Some(existing) = self.actors.get(&entity.id).map(|a| a.value().clone()) {
            existing.update(entity, engines);
            return Ok(existing);
        }

        let actor = Actor::spawn(entity, engines, &service, self.handler.clone())?;
        self.actors.insert(actor.id().clone(), actor.clone());
        Ok(actor)
    }

    pub async fn remove(&self, entity_id: &EntityId) -> HubResult<()> {
        let _guard = self.change_lock.lock().await;
        let (_, actor) = self
            .actors
            .remove(entity_id)
            .ok_or_else(|| HubError::not_found("actor", entity_id))?;
        actor.stop().await;
        Ok(())
    }

    pub fn get(&self, entity_id: &EntityId) -> HubResult<SharedActor> {
        self.actors
            .get(entity_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| HubError::not_found("actor", entity_id))
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.actors.contains_key(entity_id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.actors.iter().map(|a| a.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Stop every actor and forget the service; used by unload
    pub async fn clear(&self) {
        let _guard = self.change_lock.lock().await;
        let ids = self.ids();
        for id in ids {
            if let Some((_, actor)) = self.actors.remove(&id) {
                actor.stop().await;
            }
        }
        *write(&self.service) = None;
        debug!(plugin = %self.plugin, "Actors cleared");
    }
}

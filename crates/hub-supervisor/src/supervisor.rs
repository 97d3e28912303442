//! Entity-Actor Supervisor
//!
//! Entry point for everything that touches an entity: loading and
//! unloading actors, state mutation, the last-state cache and action
//! dispatch. Actions are never delivered directly; they are published to
//! the entity topic and picked up by the actor's mailbox.

use hub_config::SupervisorConfig;
use hub_core::models::{Entity, EntityStorage};
use hub_core::{topics, EntityId, Event, HubError, HubResult, StateParams, StateSnapshot, ValidationErrors};
use hub_event_bus::{handler, SharedEventBus, SubscriptionId};
use hub_script::ScriptService;
use hub_storage::{ListQuery, Repositories};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, instrument, warn};

use crate::actor::SharedActor;
use crate::bindings;
use crate::cache::{CacheStats, StateCache};
use crate::manager::SharedPluginManager;
use crate::watcher::ScriptWatcher;

/// Which actors a bulk action goes to; any match selects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSelector {
    #[serde(default)]
    pub entity_ids: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ActionSelector {
    pub fn entities(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            entity_ids: ids.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn area(area_id: i64) -> Self {
        Self {
            area_id: Some(area_id),
            ..Default::default()
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tags: vec![tag.into()],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty() && self.area_id.is_none() && self.tags.is_empty()
    }

    pub fn matches(&self, actor: &SharedActor) -> bool {
        self.entity_ids.contains(actor.id())
            || (self.area_id.is_some() && actor.area_id() == self.area_id)
            || self.tags.iter().any(|t| actor.has_tag(t))
    }
}

/// A loaded entity with its live state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub entity: Entity,
    pub state: StateSnapshot,
}

pub struct Supervisor {
    manager: SharedPluginManager,
    config: SupervisorConfig,
    cache: StateCache,
    watcher: ScriptWatcher,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
    bound: Mutex<Vec<String>>,
}

impl Supervisor {
    pub fn new(manager: SharedPluginManager, config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            cache: StateCache::new(config.last_state_ttl(), config.placeholder_ttl()),
            manager,
            config,
            watcher: ScriptWatcher::new(),
            subscriptions: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
        })
    }

    pub fn manager(&self) -> &SharedPluginManager {
        &self.manager
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.manager.service().bus
    }

    pub fn repos(&self) -> &Repositories {
        &self.manager.service().repos
    }

    pub fn scripts(&self) -> &ScriptService {
        &self.manager.service().scripts
    }

    fn subscribe<F, Fut>(self: &Arc<Self>, pattern: &'static str, on_event: F) -> HubResult<()>
    where
        F: Fn(Arc<Supervisor>, String, Event) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this: Weak<Supervisor> = Arc::downgrade(self);
        let id = self
            .bus()
            .subscribe(
                pattern,
                handler(move |topic, event| {
                    let this = this.clone();
                    async move {
                        if let Some(this) = this.upgrade() {
                            on_event(this, topic, event).await;
                        }
                    }
                }),
                false,
            )
            .map_err(HubError::internal)?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern, id));
        Ok(())
    }

    /// Subscribe, bind script capabilities, then start the plugin manager
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        self.subscribe(topics::PLUGINS, |s, _, e| async move { s.on_plugin_event(e).await })?;
        self.subscribe(topics::MODEL_ENTITIES, |s, _, e| async move { s.on_entity_model_event(e).await })?;
        self.subscribe(topics::ENTITIES, |s, _, e| async move { s.on_entity_event(e).await })?;
        self.subscribe(topics::MODEL_SCRIPTS, |s, _, e| async move { s.on_script_event(e).await })?;

        let capabilities = bindings::capabilities(Arc::downgrade(self), tokio::runtime::Handle::current());
        let names: Vec<String> = capabilities.iter().map(|c| c.name().to_string()).collect();
        self.scripts().push_functions(capabilities);
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = names;

        self.manager.start().await?;

        info!("Supervisor started");
        self.bus()
            .publish(
                topics::service("supervisor"),
                Event::ServiceStarted {
                    service: "supervisor".to_string(),
                },
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for (pattern, id) in subscriptions {
            if let Err(err) = self.bus().unsubscribe(pattern, id) {
                debug!(error = %err, "Subscription already removed");
            }
        }
        let bound = std::mem::take(&mut *self.bound.lock().unwrap_or_else(PoisonError::into_inner));
        for name in bound {
            self.scripts().pop_function(&name);
        }

        info!("Supervisor stopped");
        self.bus()
            .publish(
                topics::service("supervisor"),
                Event::ServiceStopped {
                    service: "supervisor".to_string(),
                },
            )
            .await;
    }

    /// Create the actor for `entity`; its plugin must be loaded
    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    pub async fn add_entity(&self, entity: Entity) -> HubResult<()> {
        entity.validate().into_result()?;
        self.manager.add_or_update_actor(entity.clone()).await?;
        self.watcher.record(&entity);
        self.cache.invalidate(&entity.id);

        debug!("Entity loaded");
        self.bus()
            .publish(
                topics::entity(&entity.id),
                Event::EntityLoaded {
                    plugin_name: entity.plugin_name().to_string(),
                    entity_id: entity.id.clone(),
                },
            )
            .await;
        Ok(())
    }

    /// Same path as [`Supervisor::add_entity`]; an existing actor is updated in place
    pub async fn update_entity(&self, entity: Entity) -> HubResult<()> {
        self.add_entity(entity).await
    }

    #[instrument(skip(self))]
    pub async fn unload_entity(&self, entity_id: &EntityId) -> HubResult<()> {
        self.manager.remove_actor(entity_id).await?;
        self.cache.invalidate(entity_id);
        self.watcher.forget(entity_id);

        debug!("Entity unloaded");
        self.bus()
            .publish(
                topics::entity(entity_id),
                Event::EntityUnloaded {
                    plugin_name: entity_id.plugin_name().to_string(),
                    entity_id: entity_id.clone(),
                },
            )
            .await;
        Ok(())
    }

    /// Load the stored record of `entity_id`
    pub async fn load_entity_by_id(&self, entity_id: &EntityId) -> HubResult<()> {
        let entity = self.repos().entities.get_by_id(entity_id).await?;
        self.add_entity(entity).await
    }

    pub async fn entity_is_loaded(&self, entity_id: &EntityId) -> bool {
        self.manager.get_actor(entity_id).await.is_ok()
    }

    pub async fn get_actor_by_id(&self, entity_id: &EntityId) -> HubResult<SharedActor> {
        self.manager.get_actor(entity_id).await
    }

    pub async fn get_entity_by_id(&self, entity_id: &EntityId) -> HubResult<EntityView> {
        let actor = self.get_actor_by_id(entity_id).await?;
        Ok(EntityView {
            entity: actor.entity(),
            state: actor.snapshot(),
        })
    }

    /// The only way actor state changes
    ///
    /// Lookup failures are returned. A mutation the actor rejects is logged
    /// and not returned.
    #[instrument(skip(self, params))]
    pub async fn set_state(&self, entity_id: &EntityId, params: StateParams) -> HubResult<()> {
        let actor = self.manager.get_actor(entity_id).await?;
        let change = match actor.set_state(&params) {
            Ok(change) => change,
            Err(err) => {
                warn!(error = %err, "State not applied");
                return Ok(());
            }
        };
        // after the apply, so a concurrent read cannot cache the old state
        self.cache.invalidate(entity_id);

        if params.storage_save {
            self.persist_state(entity_id.clone(), change.new.clone());
        }

        self.bus()
            .publish(
                topics::entity(entity_id),
                Event::StateChanged {
                    plugin_name: actor.plugin_name().to_string(),
                    entity_id: entity_id.clone(),
                    old_state: change.old,
                    new_state: change.new,
                    storage_save: params.storage_save,
                },
            )
            .await;
        Ok(())
    }

    fn persist_state(&self, entity_id: EntityId, state: StateSnapshot) {
        let repo = self.repos().entity_storage.clone();
        tokio::spawn(async move {
            let record = EntityStorage {
                id: 0,
                entity_id: entity_id.clone(),
                state: state.state_name().map(str::to_string),
                attributes: state.attributes,
                created_at: chrono::Utc::now(),
            };
            if let Err(err) = repo.add(record).await {
                warn!(entity_id = %entity_id, error = %err, "State not stored");
            }
        });
    }

    /// Previous and current state of an actor, served from the cache when fresh
    ///
    /// The result is also published on the entity topic.
    pub async fn get_last_state(&self, entity_id: &EntityId) -> HubResult<Event> {
        let event = self
            .cache
            .get_or_build(entity_id, || async {
                let actor = self.manager.get_actor(entity_id).await?;
                Ok(Event::LastStateChanged {
                    plugin_name: actor.plugin_name().to_string(),
                    entity_id: entity_id.clone(),
                    old_state: actor.previous(),
                    new_state: actor.snapshot(),
                })
            })
            .await?;
        self.bus().publish(topics::entity(entity_id), event.clone()).await;
        Ok(event)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn script_dependents(&self, script_id: i64) -> Vec<EntityId> {
        self.watcher.dependents(script_id)
    }

    pub async fn call_action(&self, entity_id: &EntityId, action: &str, args: Value) -> HubResult<()> {
        self.bus()
            .publish(
                topics::entity(entity_id),
                Event::CallEntityAction {
                    plugin_name: entity_id.plugin_name().to_string(),
                    entity_id: entity_id.clone(),
                    action_name: action.to_string(),
                    args,
                },
            )
            .await;
        Ok(())
    }

    /// Send `action` to every loaded actor the selector matches
    pub async fn call_action_v2(&self, selector: &ActionSelector, action: &str, args: Value) -> HubResult<usize> {
        if selector.is_empty() {
            let mut errors = ValidationErrors::new();
            errors.add("selector", "needs entity ids, an area or tags");
            return Err(errors.into());
        }
        let targets: Vec<EntityId> = self
            .manager
            .loaded_actors()
            .await
            .into_iter()
            .filter(|actor| selector.matches(actor))
            .map(|actor| actor.id().clone())
            .collect();
        for entity_id in &targets {
            self.call_action(entity_id, action, args.clone()).await?;
        }
        debug!(action, count = targets.len(), "Bulk action dispatched");
        Ok(targets.len())
    }

    pub async fn call_scene(&self, entity_id: &EntityId, args: Value) -> HubResult<()> {
        self.bus()
            .publish(
                topics::entity(entity_id),
                Event::CallScene {
                    plugin_name: entity_id.plugin_name().to_string(),
                    entity_id: entity_id.clone(),
                    args,
                },
            )
            .await;
        Ok(())
    }

    /// Publish a command event built from a script
    pub async fn push_system_event(&self, command: &str, params: serde_json::Map<String, Value>) -> HubResult<()> {
        let mut object = params;
        object.insert("type".to_string(), Value::String(command.to_string()));
        let event: Event = serde_json::from_value(Value::Object(object)).map_err(|err| {
            let mut errors = ValidationErrors::new();
            errors.add("command", err.to_string());
            HubError::Validation(errors)
        })?;
        let topic = command_topic(&event).ok_or_else(|| {
            let mut errors = ValidationErrors::new();
            errors.add("command", format!("{command} is not a system command"));
            HubError::Validation(errors)
        })?;
        self.bus().publish(topic, event).await;
        Ok(())
    }

    async fn load_plugin_entities(&self, plugin: &str) {
        let mut query = ListQuery::new(self.config.page_size.max(1), 0)
            .only_enabled()
            .in_group(plugin);
        let mut count = 0;
        loop {
            let page = match self.repos().entities.list(&query).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(plugin, error = %err, "Could not list entities");
                    return;
                }
            };
            let more = page.has_more(&query);
            for entity in page.items {
                let id = entity.id.clone();
                match self.add_entity(entity).await {
                    Ok(()) => count += 1,
                    Err(err) => warn!(plugin, entity_id = %id, error = %err, "Entity not loaded"),
                }
            }
            if !more {
                break;
            }
            query = query.next_page();
        }
        info!(plugin, count, "Plugin entities loaded");
    }

    async fn on_plugin_event(&self, event: Event) {
        match event {
            Event::PluginLoaded { plugin_name } => self.load_plugin_entities(&plugin_name).await,
            Event::PluginUnloaded { plugin_name } => {
                self.cache.invalidate_plugin(&plugin_name);
                self.watcher.forget_plugin(&plugin_name);
            }
            _ => {}
        }
    }

    async fn on_entity_model_event(&self, event: Event) {
        match event {
            Event::CreatedEntityModel { entity_id } | Event::UpdatedEntityModel { entity_id } => {
                let entity = match self.repos().entities.get_by_id(&entity_id).await {
                    Ok(entity) => entity,
                    Err(err) => {
                        warn!(entity_id = %entity_id, error = %err, "Entity record missing");
                        return;
                    }
                };
                let result = if entity.auto_load {
                    self.add_entity(entity).await
                } else if self.entity_is_loaded(&entity_id).await {
                    self.unload_entity(&entity_id).await
                } else {
                    Ok(())
                };
                if let Err(err) = result {
                    debug!(entity_id = %entity_id, error = %err, "Entity model change not applied");
                }
            }
            Event::RemovedEntityModel { entity_id } => {
                if let Err(err) = self.unload_entity(&entity_id).await {
                    debug!(entity_id = %entity_id, error = %err, "Removed entity was not loaded");
                }
            }
            _ => {}
        }
    }

    async fn on_entity_event(&self, event: Event) {
        let (entity_id, result) = match event {
            Event::EntitySetState { entity_id, params } => {
                let result = self.set_state(&entity_id, params).await;
                (entity_id, result)
            }
            Event::GetLastState { entity_id } => {
                let result = self.get_last_state(&entity_id).await.map(|_| ());
                (entity_id, result)
            }
            Event::CommandLoadEntity { entity_id } => {
                let result = self.load_entity_by_id(&entity_id).await;
                (entity_id, result)
            }
            Event::CommandUnloadEntity { entity_id } => {
                let result = self.unload_entity(&entity_id).await;
                (entity_id, result)
            }
            _ => return,
        };
        if let Err(err) = result {
            warn!(entity_id = %entity_id, error = %err, "Entity command failed");
        }
    }

    async fn on_script_event(&self, event: Event) {
        if !self.config.restart_component_if_script_changed {
            return;
        }
        match event {
            Event::UpdatedScriptModel { script_id } => {
                for entity_id in self.watcher.dependents(script_id) {
                    let entity = match self.repos().entities.get_by_id(&entity_id).await {
                        Ok(entity) => Ok(entity),
                        Err(_) => self.get_actor_by_id(&entity_id).await.map(|a| a.entity()),
                    };
                    let result = match entity {
                        Ok(entity) => self.update_entity(entity).await,
                        Err(err) => Err(err),
                    };
                    match result {
                        Ok(()) => info!(entity_id = %entity_id, script_id, "Entity reloaded after script change"),
                        Err(err) => warn!(entity_id = %entity_id, script_id, error = %err, "Entity reload failed"),
                    }
                }
            }
            Event::RemovedScriptModel { script_id } => {
                for entity_id in self.watcher.dependents(script_id) {
                    match self.unload_entity(&entity_id).await {
                        Ok(()) => info!(entity_id = %entity_id, script_id, "Entity unloaded, script removed"),
                        Err(err) => warn!(entity_id = %entity_id, script_id, error = %err, "Entity unload failed"),
                    }
                }
            }
            _ => {}
        }
    }
}

pub type SharedSupervisor = Arc<Supervisor>;

/// Topic for the command events scripts may push
fn command_topic(event: &Event) -> Option<String> {
    match event {
        Event::CommandEnableTask { id } | Event::CommandDisableTask { id } => Some(topics::task(*id)),
        Event::CommandEnableTrigger { id } | Event::CommandDisableTrigger { id } | Event::CallTrigger { id } => {
            Some(topics::trigger(*id))
        }
        Event::CallAction { id } => Some(topics::action(*id)),
        Event::CommandLoadEntity { entity_id } | Event::CommandUnloadEntity { entity_id } => {
            Some(topics::entity(entity_id))
        }
        _ => None,
    }
}

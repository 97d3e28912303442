//! Trigger engine
//!
//! Owns every running trigger. The map of instances sits behind one async
//! mutex so add, remove and update never interleave; an atomic counter
//! mirrors its size for cheap reads.

use hub_config::AutomationConfig;
use hub_core::models::Trigger;
use hub_core::{topics, Event, HubError, HubResult};
use hub_event_bus::{handler, SubscriptionId};
use hub_storage::ListQuery;
use hub_supervisor::PluginService;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::bindings;
use crate::kind::{FireMessage, TriggersPlugin, TRIGGERS_PLUGIN};
use crate::trigger::{SharedTrigger, TriggerInstance};

/// Value exposing the trigger record to its script
const TRIGGER_STRUCT: &str = "TRIGGER";

pub struct TriggerManager {
    triggers: Arc<TriggersPlugin>,
    service: PluginService,
    config: AutomationConfig,
    running: AsyncMutex<HashMap<i64, SharedTrigger>>,
    count: AtomicUsize,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
    bound: Mutex<Vec<String>>,
}

pub type SharedTriggerManager = Arc<TriggerManager>;

impl TriggerManager {
    pub fn new(triggers: Arc<TriggersPlugin>, service: PluginService, config: AutomationConfig) -> Arc<Self> {
        Arc::new(Self {
            triggers,
            service,
            config,
            running: AsyncMutex::new(HashMap::new()),
            count: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn is_loaded(&self, id: i64) -> bool {
        self.running.lock().await.contains_key(&id)
    }

    pub async fn get(&self, id: i64) -> HubResult<SharedTrigger> {
        self.running
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HubError::not_found("trigger", id))
    }

    /// Start a trigger
    ///
    /// A duplicate id is rejected and the running instance kept. A disabled
    /// trigger is accepted and ignored.
    #[instrument(skip(self, model), fields(trigger_id = model.id))]
    pub async fn add(&self, model: Trigger) -> HubResult<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(&model.id) {
            return Err(HubError::already_exists("trigger", model.id));
        }
        if !model.enabled {
            debug!("Trigger disabled, not started");
            return Ok(());
        }

        let kind = self.triggers.kind(&model.plugin_name)?;
        let engine = match model.script_id {
            Some(script_id) => {
                let script = self.service.repos.scripts.get_by_id(&script_id).await?;
                let engine = self.service.scripts.new_engine(&script)?;
                engine.push_struct(TRIGGER_STRUCT, json!({ "id": model.id, "name": model.name }))?;
                Some(engine)
            }
            None => None,
        };

        let id = model.id;
        let instance = TriggerInstance::new(model, kind, engine, self.service.bus.clone());
        instance.start().map_err(HubError::internal)?;
        running.insert(id, instance);
        self.count.fetch_add(1, Ordering::SeqCst);
        info!("Trigger added");
        Ok(())
    }

    /// Stop a trigger; unknown ids are ignored
    #[instrument(skip(self))]
    pub async fn remove(&self, id: i64) {
        let removed = self.running.lock().await.remove(&id);
        if let Some(instance) = removed {
            instance.stop();
            let _ = self
                .count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
            info!("Trigger removed");
        }
    }

    /// Remove, then add again from the stored record
    pub async fn update(&self, id: i64) -> HubResult<()> {
        self.remove(id).await;
        let model = self.service.repos.triggers.get_by_id(&id).await?;
        self.add(model).await
    }

    /// Validate and persist a new trigger, then start it
    pub async fn create(&self, model: Trigger) -> HubResult<Trigger> {
        model.validate().into_result()?;
        let stored = self.service.repos.triggers.add(model).await?;
        self.add(stored.clone()).await?;
        Ok(stored)
    }

    /// Stop and forget a stored trigger
    pub async fn delete(&self, id: i64) -> HubResult<()> {
        self.remove(id).await;
        self.service.repos.triggers.delete(&id).await?;
        Ok(())
    }

    /// Fire a trigger by hand, skipping its script
    pub async fn call(&self, id: i64) -> HubResult<()> {
        let instance = self.get(id).await?;
        instance
            .call(FireMessage {
                entity_id: None,
                payload: json!({ "manual": true }),
            })
            .await
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> HubResult<()> {
        let mut model = self.service.repos.triggers.get_by_id(&id).await?;
        if model.enabled != enabled {
            model.enabled = enabled;
            self.service.repos.triggers.update(model).await?;
        }
        Ok(())
    }

    fn subscribe<F, Fut>(self: &Arc<Self>, pattern: &'static str, on_event: F) -> HubResult<()>
    where
        F: Fn(Arc<TriggerManager>, Event) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this: Weak<TriggerManager> = Arc::downgrade(self);
        let id = self
            .service
            .bus
            .subscribe(
                pattern,
                handler(move |_, event| {
                    let this = this.clone();
                    async move {
                        if let Some(this) = this.upgrade() {
                            on_event(this, event).await;
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

    /// Subscribe, start every enabled trigger, then bind script capabilities
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        self.subscribe(topics::TRIGGERS, |m, e| async move { m.on_trigger_event(e).await })?;
        self.subscribe(topics::MODEL_TRIGGERS, |m, e| async move { m.on_model_event(e).await })?;
        self.subscribe(topics::PLUGINS, |m, e| async move { m.on_plugin_event(e).await })?;

        let mut query = ListQuery::new(self.config.page_size.max(1), 0).only_enabled();
        loop {
            let page = self.service.repos.triggers.list(&query).await?;
            let more = page.has_more(&query);
            for model in page.items {
                let id = model.id;
                if let Err(err) = self.add(model).await {
                    warn!(trigger_id = id, error = %err, "Trigger not started");
                }
            }
            if !more {
                break;
            }
            query = query.next_page();
        }

        let capabilities = bindings::capabilities(Arc::downgrade(self), tokio::runtime::Handle::current());
        let names: Vec<String> = capabilities.iter().map(|c| c.name().to_string()).collect();
        self.service.scripts.push_functions(capabilities);
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = names;

        info!(count = self.count(), "Trigger engine started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for (pattern, id) in subscriptions {
            if let Err(err) = self.service.bus.unsubscribe(pattern, id) {
                debug!(error = %err, "Subscription already removed");
            }
        }
        let bound = std::mem::take(&mut *self.bound.lock().unwrap_or_else(PoisonError::into_inner));
        for name in bound {
            self.service.scripts.pop_function(&name);
        }

        let stopped: Vec<SharedTrigger> = self.running.lock().await.drain().map(|(_, t)| t).collect();
        for instance in &stopped {
            instance.stop();
        }
        self.count.store(0, Ordering::SeqCst);
        info!(count = stopped.len(), "Trigger engine stopped");
    }

    async fn on_trigger_event(&self, event: Event) {
        let (id, result) = match event {
            Event::CommandEnableTrigger { id } => {
                let result = match self.set_enabled(id, true).await {
                    Ok(()) => self.update(id).await,
                    Err(err) => Err(err),
                };
                (id, result)
            }
            Event::CommandDisableTrigger { id } => {
                self.remove(id).await;
                (id, self.set_enabled(id, false).await)
            }
            Event::CallTrigger { id } => (id, self.call(id).await),
            _ => return,
        };
        if let Err(err) = result {
            warn!(trigger_id = id, error = %err, "Trigger command failed");
        }
    }

    async fn on_model_event(&self, event: Event) {
        match event {
            Event::CreatedTriggerModel { id } | Event::UpdatedTriggerModel { id } => {
                if let Err(err) = self.update(id).await {
                    warn!(trigger_id = id, error = %err, "Trigger not reloaded");
                }
            }
            Event::RemovedTriggerModel { id } => self.remove(id).await,
            _ => {}
        }
    }

    /// Triggers whose kind went away are stopped, not retried
    async fn on_plugin_event(&self, event: Event) {
        let Event::PluginUnloaded { plugin_name } = event else {
            return;
        };
        let owned: Vec<i64> = self
            .running
            .lock()
            .await
            .values()
            .filter(|t| plugin_name == TRIGGERS_PLUGIN || t.plugin_name() == plugin_name)
            .map(|t| t.id())
            .collect();
        for id in owned {
            self.remove(id).await;
            warn!(trigger_id = id, plugin = %plugin_name, "Trigger stopped, its plugin was unloaded");
        }
    }
}

//! Task engine
//!
//! A task listens to the completion of its triggers, checks its conditions
//! and then runs its actions in order.

use hub_config::AutomationConfig;
use hub_core::models::{Action, Condition, ConditionType, Task};
use hub_core::{topics, EntityId, Event, HubError, HubResult};
use hub_event_bus::{handler, SharedEventBus, SubscriptionId};
use hub_script::{call_blocking, ScriptService, SharedEngine};
use hub_storage::{ListQuery, Repositories};
use hub_supervisor::SharedSupervisor;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

pub const CONDITION_FN: &str = "automationCondition";
pub const ACTION_FN: &str = "automationAction";

/// A condition with its compiled script
pub struct ConditionRunner {
    model: Condition,
    engine: Option<SharedEngine>,
}

impl ConditionRunner {
    pub fn new(model: Condition, engine: Option<SharedEngine>) -> Self {
        Self { model, engine }
    }

    /// A condition without a script holds; a failing script does not
    pub async fn check(&self, entity_id: Option<&EntityId>) -> bool {
        let Some(engine) = &self.engine else {
            return true;
        };
        match call_blocking(engine.clone(), CONDITION_FN, vec![json!(entity_id)]).await {
            Ok(output) => output == "true",
            Err(err) => {
                warn!(condition_id = self.model.id, error = %err, "Condition script failed");
                false
            }
        }
    }
}

/// An action with its compiled script
pub struct ActionRunner {
    model: Action,
    engine: Option<SharedEngine>,
}

impl ActionRunner {
    pub fn new(model: Action, engine: Option<SharedEngine>) -> Self {
        Self { model, engine }
    }

    pub fn id(&self) -> i64 {
        self.model.id
    }

    /// Direct entity call first, then the script
    pub async fn run(&self, supervisor: &SharedSupervisor, entity_id: Option<&EntityId>) -> HubResult<()> {
        if let Some(target) = &self.model.entity_id {
            match &self.model.action_name {
                Some(action) => supervisor.call_action(target, action, json!({})).await?,
                None => supervisor.call_scene(target, Value::Null).await?,
            }
        }
        if let Some(engine) = &self.engine {
            call_blocking(engine.clone(), ACTION_FN, vec![json!(entity_id)]).await?;
        }
        Ok(())
    }
}

/// Short-circuit combination of condition checks
pub async fn evaluate(kind: ConditionType, conditions: &[ConditionRunner], entity_id: Option<&EntityId>) -> bool {
    match kind {
        ConditionType::And => {
            for condition in conditions {
                if !condition.check(entity_id).await {
                    return false;
                }
            }
            true
        }
        ConditionType::Or => {
            for condition in conditions {
                if condition.check(entity_id).await {
                    return true;
                }
            }
            false
        }
    }
}

pub struct TaskInstance {
    model: Task,
    conditions: Vec<ConditionRunner>,
    actions: Vec<ActionRunner>,
    supervisor: SharedSupervisor,
    bus: SharedEventBus,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

pub type SharedTask = Arc<TaskInstance>;

impl TaskInstance {
    pub fn new(
        model: Task,
        conditions: Vec<ConditionRunner>,
        actions: Vec<ActionRunner>,
        supervisor: SharedSupervisor,
    ) -> SharedTask {
        let bus = supervisor.bus().clone();
        Arc::new(Self {
            model,
            conditions,
            actions,
            supervisor,
            bus,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> i64 {
        self.model.id
    }

    pub fn model(&self) -> &Task {
        &self.model
    }

    /// Conditions, then every action; returns whether the actions ran
    pub async fn run(&self, entity_id: Option<&EntityId>) -> bool {
        if !evaluate(self.model.condition, &self.conditions, entity_id).await {
            debug!(task_id = self.id(), "Task conditions not met");
            return false;
        }
        for action in &self.actions {
            if let Err(err) = action.run(&self.supervisor, entity_id).await {
                warn!(task_id = self.id(), action_id = action.id(), error = %err, "Task action failed");
            }
        }
        debug!(task_id = self.id(), actions = self.actions.len(), "Task ran");
        true
    }

    /// Listen to the completion of every trigger of the task
    pub fn start(self: &Arc<Self>) -> HubResult<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        for trigger_id in &self.model.trigger_ids {
            let topic = topics::trigger(*trigger_id);
            let this: Weak<TaskInstance> = Arc::downgrade(self);
            let id = self
                .bus
                .subscribe(
                    &topic,
                    handler(move |_, event| {
                        let this = this.clone();
                        async move {
                            let Event::TriggerCompleted { entity_id, .. } = event else {
                                return;
                            };
                            if let Some(this) = this.upgrade() {
                                this.run(entity_id.as_ref()).await;
                            }
                        }
                    }),
                    false,
                )
                .map_err(HubError::internal)?;
            subscriptions.push((topic, id));
        }
        Ok(())
    }

    pub fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for (topic, id) in subscriptions {
            if let Err(err) = self.bus.unsubscribe(&topic, id) {
                debug!(task_id = self.id(), error = %err, "Task subscription already gone");
            }
        }
    }
}

async fn engine_for(
    repos: &Repositories,
    scripts: &ScriptService,
    script_id: Option<i64>,
) -> HubResult<Option<SharedEngine>> {
    let Some(script_id) = script_id else {
        return Ok(None);
    };
    let script = repos.scripts.get_by_id(&script_id).await?;
    Ok(Some(scripts.new_engine(&script)?))
}

pub struct TaskManager {
    supervisor: SharedSupervisor,
    config: AutomationConfig,
    tasks: AsyncMutex<HashMap<i64, SharedTask>>,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

pub type SharedTaskManager = Arc<TaskManager>;

impl TaskManager {
    pub fn new(supervisor: SharedSupervisor, config: AutomationConfig) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            config,
            tasks: AsyncMutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn repos(&self) -> &Repositories {
        self.supervisor.repos()
    }

    pub async fn count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_loaded(&self, id: i64) -> bool {
        self.tasks.lock().await.contains_key(&id)
    }

    pub async fn get(&self, id: i64) -> HubResult<SharedTask> {
        self.tasks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HubError::not_found("task", id))
    }

    async fn build_condition(&self, id: i64) -> HubResult<ConditionRunner> {
        let model = self.repos().conditions.get_by_id(&id).await?;
        let engine = engine_for(self.repos(), self.supervisor.scripts(), model.script_id).await?;
        Ok(ConditionRunner::new(model, engine))
    }

    async fn build_action(&self, id: i64) -> HubResult<ActionRunner> {
        let model = self.repos().actions.get_by_id(&id).await?;
        let engine = engine_for(self.repos(), self.supervisor.scripts(), model.script_id).await?;
        Ok(ActionRunner::new(model, engine))
    }

    /// Build and start a task; duplicates are rejected, disabled tasks ignored
    #[instrument(skip(self, model), fields(task_id = model.id))]
    pub async fn add(&self, model: Task) -> HubResult<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&model.id) {
            return Err(HubError::already_exists("task", model.id));
        }
        if !model.enabled {
            debug!("Task disabled, not started");
            return Ok(());
        }

        let mut conditions = Vec::with_capacity(model.condition_ids.len());
        for id in &model.condition_ids {
            conditions.push(self.build_condition(*id).await?);
        }
        let mut actions = Vec::with_capacity(model.action_ids.len());
        for id in &model.action_ids {
            actions.push(self.build_action(*id).await?);
        }

        let id = model.id;
        let task = TaskInstance::new(model, conditions, actions, self.supervisor.clone());
        task.start()?;
        tasks.insert(id, task);
        info!("Task added");
        Ok(())
    }

    /// Unknown ids are ignored
    pub async fn remove(&self, id: i64) {
        let removed = self.tasks.lock().await.remove(&id);
        if let Some(task) = removed {
            task.stop();
            info!(task_id = id, "Task removed");
        }
    }

    pub async fn reload(&self, id: i64) -> HubResult<()> {
        self.remove(id).await;
        let model = self.repos().tasks.get_by_id(&id).await?;
        self.add(model).await
    }

    /// Run one stored action outside of any task
    pub async fn run_action(&self, id: i64) -> HubResult<()> {
        let action = self.build_action(id).await?;
        action.run(&self.supervisor, None).await
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> HubResult<()> {
        let mut model = self.repos().tasks.get_by_id(&id).await?;
        if model.enabled != enabled {
            model.enabled = enabled;
            self.repos().tasks.update(model).await?;
        }
        Ok(())
    }

    fn subscribe<F, Fut>(self: &Arc<Self>, pattern: &'static str, on_event: F) -> HubResult<()>
    where
        F: Fn(Arc<TaskManager>, Event) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this: Weak<TaskManager> = Arc::downgrade(self);
        let id = self
            .supervisor
            .bus()
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

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        self.subscribe(topics::TASKS, |m, e| async move { m.on_task_event(e).await })?;
        self.subscribe(topics::MODEL_TASKS, |m, e| async move { m.on_model_event(e).await })?;
        self.subscribe(topics::ACTIONS, |m, e| async move { m.on_action_event(e).await })?;

        let mut query = ListQuery::new(self.config.page_size.max(1), 0).only_enabled();
        loop {
            let page = self.repos().tasks.list(&query).await?;
            let more = page.has_more(&query);
            for model in page.items {
                let id = model.id;
                if let Err(err) = self.add(model).await {
                    warn!(task_id = id, error = %err, "Task not started");
                }
            }
            if !more {
                break;
            }
            query = query.next_page();
        }
        info!(count = self.count().await, "Task engine started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner));
        for (pattern, id) in subscriptions {
            if let Err(err) = self.supervisor.bus().unsubscribe(pattern, id) {
                debug!(error = %err, "Subscription already removed");
            }
        }
        let stopped: Vec<SharedTask> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in &stopped {
            task.stop();
        }
        info!(count = stopped.len(), "Task engine stopped");
    }

    async fn on_task_event(&self, event: Event) {
        let (id, result) = match event {
            Event::CommandEnableTask { id } => {
                let result = match self.set_enabled(id, true).await {
                    Ok(()) => self.reload(id).await,
                    Err(err) => Err(err),
                };
                (id, result)
            }
            Event::CommandDisableTask { id } => {
                self.remove(id).await;
                (id, self.set_enabled(id, false).await)
            }
            _ => return,
        };
        if let Err(err) = result {
            warn!(task_id = id, error = %err, "Task command failed");
        }
    }

    async fn on_model_event(&self, event: Event) {
        match event {
            Event::CreatedTaskModel { id } | Event::UpdatedTaskModel { id } => {
                if let Err(err) = self.reload(id).await {
                    warn!(task_id = id, error = %err, "Task not reloaded");
                }
            }
            Event::RemovedTaskModel { id } => self.remove(id).await,
            _ => {}
        }
    }

    async fn on_action_event(&self, event: Event) {
        if let Event::CallAction { id } = event {
            if let Err(err) = self.run_action(id).await {
                warn!(action_id = id, error = %err, "Action failed");
            }
        }
    }
}

//! Automation test hub
//!
//! The trigger kind plugins plus one device plugin whose actors record the
//! commands they receive.

#![allow(dead_code)]

use async_trait::async_trait;
use hub_automation::{plugins, TaskManager, TriggerManager, TriggersPlugin};
use hub_config::{AutomationConfig, PluginsConfig, SupervisorConfig};
use hub_core::models::{Entity, Script};
use hub_core::{EntityId, Event, HubResult};
use hub_event_bus::{handler, EventBus, SharedEventBus};
use hub_script::ScriptService;
use hub_storage::Repositories;
use hub_supervisor::{
    ActionHandler, Actor, ActorSet, Plugin, PluginManager, PluginService, Registry, SharedPlugin,
    SharedPluginManager, SharedSupervisor, StaticLoader, Supervisor,
};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    args: Mutex<Vec<Value>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Arguments of each recorded action, in call order
    pub fn args(&self) -> Vec<Value> {
        self.args.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionHandler for Recorder {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()> {
        self.args.lock().unwrap().push(args);
        self.calls.lock().unwrap().push(format!("{}:{action}", actor.id()));
        Ok(())
    }

    async fn call_scene(&self, actor: &Actor, _args: Value) -> HubResult<()> {
        self.calls.lock().unwrap().push(format!("{}:scene", actor.id()));
        Ok(())
    }
}

pub struct DevicePlugin {
    actors: ActorSet,
}

#[async_trait]
impl Plugin for DevicePlugin {
    fn name(&self) -> &str {
        "sensorA"
    }

    async fn load(&self, service: PluginService) -> HubResult<()> {
        self.actors.bind(service);
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        self.actors.clear().await;
        Ok(())
    }

    fn actors(&self) -> Option<&ActorSet> {
        Some(&self.actors)
    }
}

pub struct AutomationHub {
    pub bus: SharedEventBus,
    pub repos: Repositories,
    pub scripts: ScriptService,
    pub manager: SharedPluginManager,
    pub supervisor: SharedSupervisor,
    pub triggers: Arc<TriggersPlugin>,
    pub trigger_manager: Arc<TriggerManager>,
    pub task_manager: Arc<TaskManager>,
    pub recorder: Arc<Recorder>,
}

impl AutomationHub {
    pub async fn new() -> Self {
        Self::with_config(AutomationConfig::default()).await
    }

    /// Supervisor started and every plugin loaded; the engines are not started
    pub async fn with_config(config: AutomationConfig) -> Self {
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let repos = Repositories::in_memory();
        let scripts = ScriptService::new();
        let service = PluginService::new(bus.clone(), repos.clone(), scripts.clone());

        let recorder = Arc::new(Recorder::default());
        let triggers = TriggersPlugin::new();
        let device = Arc::new(DevicePlugin {
            actors: ActorSet::with_handler("sensorA", recorder.clone()),
        });
        let loader = plugins(&triggers)
            .into_iter()
            .chain([device as SharedPlugin])
            .fold(StaticLoader::new(), |loader, plugin| loader.with_instance(plugin));
        let registry = Arc::new(Registry::new());
        registry.register_from(&loader).unwrap();

        let manager = Arc::new(PluginManager::new(registry, service.clone(), PluginsConfig::default()));
        let supervisor = Supervisor::new(manager.clone(), SupervisorConfig::default());
        // the trigger plugins are system plugins and load with the supervisor
        supervisor.start().await.unwrap();
        manager.load("sensorA").await.unwrap();

        let trigger_manager = TriggerManager::new(triggers.clone(), service, config.clone());
        let task_manager = TaskManager::new(supervisor.clone(), config);
        Self {
            bus,
            repos,
            scripts,
            manager,
            supervisor,
            triggers,
            trigger_manager,
            task_manager,
            recorder,
        }
    }

    pub async fn load_entity(&self, entity_id: &EntityId) {
        self.supervisor.add_entity(Entity::new(entity_id.clone())).await.unwrap();
    }

    pub async fn script(&self, source: &str) -> i64 {
        self.repos.scripts.add(Script::new("test", source)).await.unwrap().id
    }

    pub fn capture(&self, pattern: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .subscribe(
                pattern,
                handler(move |_, event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
                false,
            )
            .unwrap();
        rx
    }
}

pub fn id(s: &str) -> EntityId {
    s.parse().unwrap()
}

pub async fn next_matching(rx: &mut mpsc::UnboundedReceiver<Event>, pred: impl Fn(&Event) -> bool) -> Option<Event> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

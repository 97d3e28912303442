//! Test hub
//!
//! An isolated bus, in-memory repositories and a supervisor over a set of
//! test plugins, plus helpers for waiting on bus traffic.

#![allow(dead_code)]

use async_trait::async_trait;
use hub_config::{PluginsConfig, SupervisorConfig};
use hub_core::models::{Entity, PluginKind};
use hub_core::{Event, HubError, HubResult};
use hub_event_bus::{handler, EventBus, SharedEventBus};
use hub_script::ScriptService;
use hub_storage::Repositories;
use hub_supervisor::{
    ActionHandler, Actor, ActorSet, Plugin, PluginManager, PluginService, Registry, SharedPlugin,
    SharedPluginManager, SharedSupervisor, StaticLoader, Supervisor,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};

pub const WAIT: Duration = Duration::from_secs(5);

/// Plugin without actors that counts its lifecycle calls
pub struct CountingPlugin {
    pub name: String,
    pub kind: PluginKind,
    pub depends: Vec<String>,
    pub fail_load: bool,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub installs: AtomicUsize,
    pub uninstalls: AtomicUsize,
}

impl CountingPlugin {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, PluginKind::BuiltIn, &[], false)
    }

    pub fn build(name: &str, kind: PluginKind, depends: &[&str], fail_load: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            depends: depends.iter().map(|d| d.to_string()).collect(),
            fail_load,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for CountingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn depends(&self) -> Vec<String> {
        self.depends.clone()
    }

    async fn load(&self, _service: PluginService) -> HubResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(HubError::internal("device not reachable"));
        }
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn install(&self) -> HubResult<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn uninstall(&self) -> HubResult<()> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Plugin owning actors
pub struct DevicePlugin {
    name: String,
    actors: ActorSet,
}

impl DevicePlugin {
    /// Actors run their scripts
    pub fn scripted(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            actors: ActorSet::new(name),
        })
    }

    pub fn with_handler(name: &str, handler: Arc<dyn ActionHandler>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            actors: ActorSet::with_handler(name, handler),
        })
    }
}

#[async_trait]
impl Plugin for DevicePlugin {
    fn name(&self) -> &str {
        &self.name
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

/// Records every command; optionally holds each one until released
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<String>>,
    /// Arguments of each recorded action, in call order
    pub args: Mutex<Vec<Value>>,
    pub started: Notify,
    gate: Option<Semaphore>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every command waits for a permit
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn args(&self) -> Vec<Value> {
        self.args.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()> {
        if action == "boom" {
            panic!("action exploded");
        }
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.args.lock().unwrap().push(args);
        self.calls.lock().unwrap().push(format!("{}:{action}", actor.id()));
        Ok(())
    }

    async fn call_scene(&self, actor: &Actor, _args: Value) -> HubResult<()> {
        self.calls.lock().unwrap().push(format!("{}:scene", actor.id()));
        Ok(())
    }
}

pub struct TestHub {
    pub bus: SharedEventBus,
    pub repos: Repositories,
    pub scripts: ScriptService,
    pub manager: SharedPluginManager,
    pub supervisor: SharedSupervisor,
}

impl TestHub {
    pub fn new(plugins: Vec<SharedPlugin>) -> Self {
        Self::with_config(plugins, PluginsConfig::default(), SupervisorConfig::default())
    }

    pub fn with_config(plugins: Vec<SharedPlugin>, plugins_config: PluginsConfig, config: SupervisorConfig) -> Self {
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let repos = Repositories::in_memory();
        let scripts = ScriptService::new();
        let service = PluginService::new(bus.clone(), repos.clone(), scripts.clone())
            .with_mailbox_depth(config.mailbox_depth);

        let registry = Arc::new(Registry::new());
        let loader = plugins
            .into_iter()
            .fold(StaticLoader::new(), |loader, plugin| loader.with_instance(plugin));
        registry.register_from(&loader).unwrap();

        let manager = Arc::new(PluginManager::new(registry, service, plugins_config));
        let supervisor = Supervisor::new(manager.clone(), config);
        Self {
            bus,
            repos,
            scripts,
            manager,
            supervisor,
        }
    }

    /// Everything published on topics matching `pattern`
    pub fn capture(&self, pattern: &str) -> mpsc::UnboundedReceiver<(String, Event)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus
            .subscribe(
                pattern,
                handler(move |topic, event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((topic, event));
                    }
                }),
                false,
            )
            .unwrap();
        rx
    }

    pub async fn load_entity(&self, entity: Entity) {
        self.supervisor.add_entity(entity).await.unwrap();
    }
}

/// First captured event accepted by `pred`, or `None` after [`WAIT`]
pub async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<(String, Event)>,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    tokio::time::timeout(WAIT, async {
        while let Some((_, event)) = rx.recv().await {
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

/// Poll `check` until it holds or [`WAIT`] runs out
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

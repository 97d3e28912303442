//! Plugins, actors and the supervisor
//!
//! - [`PluginManager`] loads and unloads [`Plugin`]s and is the only place
//!   that decides whether a plugin is loaded
//! - [`Actor`]s are owned by their plugin's [`ActorSet`] and consume
//!   commands from a bounded mailbox
//! - [`Supervisor`] is the entry point for entity operations and keeps the
//!   last-state cache

mod actor;
mod bindings;
mod cache;
pub mod geo;
mod manager;
mod plugin;
pub mod process;
mod registry;
mod state_machine;
mod supervisor;
mod watcher;

pub use actor::{
    ActionHandler, Actor, ActorEngines, ActorSet, ScriptActions, SharedActor, StateChange, ENTITY_ACTION_FN,
    ENTITY_SCENE_FN,
};
pub use cache::{CacheStats, StateCache};
pub use manager::{plan_waves, PluginManager, SharedPluginManager};
pub use plugin::{Plugin, PluginService, SharedPlugin};
pub use process::{ProcessPlugin, ProcessPluginLoader};
pub use registry::{PluginFactory, PluginLoader, Registry, SharedRegistry, StaticLoader};
pub use state_machine::{InvalidTransition, PluginState};
pub use supervisor::{ActionSelector, EntityView, SharedSupervisor, Supervisor};
pub use watcher::ScriptWatcher;

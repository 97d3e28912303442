//! Automation: triggers fire, tasks react
//!
//! - [`TriggersPlugin`] is the registrar trigger kinds plug into;
//!   [`StateChangePlugin`] and [`SystemPlugin`] are the built-in kinds
//! - [`TriggerManager`] owns the running triggers
//! - [`TaskManager`] runs tasks when their triggers complete

mod bindings;
mod kind;
mod manager;
mod state_change;
mod system;
mod task;
mod trigger;

use hub_supervisor::SharedPlugin;
use std::sync::Arc;

pub use kind::{
    FireHandler, FireMessage, SharedTriggerKind, Subscriber, Subscribers, TriggerKind, TriggersPlugin, TRIGGERS_PLUGIN,
};
pub use manager::{SharedTriggerManager, TriggerManager};
pub use state_change::{StateChangePlugin, STATE_CHANGE_PLUGIN};
pub use system::{SystemPlugin, SYSTEM_PLUGIN};
pub use task::{
    evaluate, ActionRunner, ConditionRunner, SharedTask, SharedTaskManager, TaskInstance, TaskManager, ACTION_FN,
    CONDITION_FN,
};
pub use trigger::{SharedTrigger, TriggerInstance, TriggerState, TriggerTransition};

/// The registrar plus every built-in trigger kind, ready for a registry
pub fn plugins(triggers: &Arc<TriggersPlugin>) -> Vec<SharedPlugin> {
    vec![
        triggers.clone() as SharedPlugin,
        StateChangePlugin::new(triggers.clone()) as SharedPlugin,
        SystemPlugin::new(triggers.clone()) as SharedPlugin,
    ]
}

//! A running trigger
//!
//! ```text
//! Unbound --start--> Running --stop--> Stopped
//! ```
//!
//! A stopped trigger is never restarted; the manager builds a new instance.

use hub_core::models::Trigger;
use hub_core::{topics, Event, HubResult};
use hub_event_bus::SharedEventBus;
use hub_script::{call_blocking, SharedEngine};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::kind::{FireMessage, SharedTriggerKind, Subscriber};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerState {
    #[default]
    Unbound,
    Running,
    Stopped,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerState::Unbound => "unbound",
            TriggerState::Running => "running",
            TriggerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("trigger cannot go from {from} to {to}")]
pub struct TriggerTransition {
    pub from: TriggerState,
    pub to: TriggerState,
}

impl TriggerState {
    pub fn can_transition_to(&self, to: TriggerState) -> bool {
        matches!(
            (self, to),
            (TriggerState::Unbound, TriggerState::Running)
                | (TriggerState::Unbound, TriggerState::Stopped)
                | (TriggerState::Running, TriggerState::Stopped)
        )
    }

    pub fn try_transition(&mut self, to: TriggerState) -> Result<(), TriggerTransition> {
        if !self.can_transition_to(to) {
            return Err(TriggerTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

pub struct TriggerInstance {
    model: Trigger,
    kind: SharedTriggerKind,
    engine: Option<SharedEngine>,
    bus: SharedEventBus,
    state: Mutex<TriggerState>,
    fired: AtomicU64,
    completed: AtomicU64,
}

pub type SharedTrigger = Arc<TriggerInstance>;

impl TriggerInstance {
    pub fn new(model: Trigger, kind: SharedTriggerKind, engine: Option<SharedEngine>, bus: SharedEventBus) -> SharedTrigger {
        Arc::new(Self {
            model,
            kind,
            engine,
            bus,
            state: Mutex::new(TriggerState::Unbound),
            fired: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> i64 {
        self.model.id
    }

    pub fn model(&self) -> &Trigger {
        &self.model
    }

    /// Plugin providing this trigger's kind
    pub fn plugin_name(&self) -> &str {
        &self.model.plugin_name
    }

    pub fn state(&self) -> TriggerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Times the kind reported a match
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Times a fire was published as completed
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Subscribe to the kind
    pub fn start(self: &Arc<Self>) -> Result<(), TriggerTransition> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_transition(TriggerState::Running)?;

        let this: Weak<TriggerInstance> = Arc::downgrade(self);
        self.kind.subscribe(Subscriber {
            trigger_id: self.id(),
            entity_ids: self.model.entity_ids.clone(),
            payload: self.model.payload.clone(),
            handler: Arc::new(move |message| {
                if let Some(this) = this.upgrade() {
                    tokio::spawn(async move { this.fire(message).await });
                }
            }),
        });
        debug!(trigger_id = self.id(), kind = self.kind.name(), "Trigger started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.try_transition(TriggerState::Stopped).is_ok() {
            self.kind.unsubscribe(self.id());
            debug!(trigger_id = self.id(), "Trigger stopped");
        }
    }

    /// Handle a match reported by the kind
    ///
    /// With a script attached, the kind's function must return `true`.
    pub async fn fire(&self, message: FireMessage) {
        if self.state() != TriggerState::Running {
            return;
        }
        self.fired.fetch_add(1, Ordering::Relaxed);

        if let Some(engine) = &self.engine {
            let arg = json!({
                "trigger_id": self.id(),
                "entity_id": message.entity_id,
                "payload": message.payload,
            });
            match call_blocking(engine.clone(), self.kind.function_name(), vec![arg]).await {
                Ok(output) if output == "true" => {}
                Ok(output) => {
                    trace!(trigger_id = self.id(), output = %output, "Trigger script declined");
                    return;
                }
                Err(err) => {
                    warn!(trigger_id = self.id(), error = %err, "Trigger script failed");
                    return;
                }
            }
        }
        self.complete(message).await;
    }

    /// Complete without consulting the script
    pub async fn call(&self, message: FireMessage) -> HubResult<()> {
        if self.state() != TriggerState::Running {
            return Err(hub_core::HubError::internal(format!(
                "trigger {} is {}",
                self.id(),
                self.state()
            )));
        }
        self.fired.fetch_add(1, Ordering::Relaxed);
        self.complete(message).await;
        Ok(())
    }

    async fn complete(&self, message: FireMessage) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(trigger_id = self.id(), "Trigger completed");
        self.bus
            .publish(
                topics::trigger(self.id()),
                Event::TriggerCompleted {
                    id: self.id(),
                    entity_id: message.entity_id,
                    args: message.payload,
                },
            )
            .await;
    }
}

impl Drop for TriggerInstance {
    fn drop(&mut self) {
        if *self.state.get_mut().unwrap_or_else(PoisonError::into_inner) == TriggerState::Running {
            self.kind.unsubscribe(self.model.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut state = TriggerState::default();
        assert_eq!(state, TriggerState::Unbound);
        state.try_transition(TriggerState::Running).unwrap();
        state.try_transition(TriggerState::Stopped).unwrap();
        assert_eq!(
            state.try_transition(TriggerState::Running),
            Err(TriggerTransition {
                from: TriggerState::Stopped,
                to: TriggerState::Running,
            })
        );
        assert!(TriggerState::Unbound.can_transition_to(TriggerState::Stopped));
        assert!(!TriggerState::Running.can_transition_to(TriggerState::Unbound));
    }

    #[test]
    fn test_display() {
        assert_eq!(TriggerState::Running.to_string(), "running");
        assert_eq!(
            TriggerTransition {
                from: TriggerState::Stopped,
                to: TriggerState::Running
            }
            .to_string(),
            "trigger cannot go from stopped to running"
        );
    }
}

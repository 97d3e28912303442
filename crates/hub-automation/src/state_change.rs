//! `state_change` trigger kind: fires when an observed entity changes state

use async_trait::async_trait;
use hub_core::models::PluginKind;
use hub_core::{topics, Event, HubError, HubResult};
use hub_event_bus::{handler, SharedEventBus, SubscriptionId};
use hub_supervisor::{Plugin, PluginService};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

use crate::kind::{FireMessage, Subscriber, Subscribers, TriggerKind, TriggersPlugin, TRIGGERS_PLUGIN};

pub const STATE_CHANGE_PLUGIN: &str = "state_change";

struct StateChangeKind {
    subscribers: Subscribers,
}

impl StateChangeKind {
    fn dispatch(&self, event: &Event) {
        let Event::StateChanged { entity_id, .. } = event else {
            return;
        };
        let targets = self.subscribers.matching(|s| s.observes(entity_id));
        if targets.is_empty() {
            return;
        }
        let payload = serde_json::to_value(event).unwrap_or_default();
        trace!(entity_id = %entity_id, count = targets.len(), "State change matched triggers");
        for subscriber in targets {
            subscriber.fire(FireMessage {
                entity_id: Some(entity_id.clone()),
                payload: payload.clone(),
            });
        }
    }
}

impl TriggerKind for StateChangeKind {
    fn name(&self) -> &str {
        STATE_CHANGE_PLUGIN
    }

    fn function_name(&self) -> &str {
        "automationTriggerStateChanged"
    }

    fn subscribe(&self, subscriber: Subscriber) {
        debug!(trigger_id = subscriber.trigger_id, "State change trigger subscribed");
        self.subscribers.insert(subscriber);
    }

    fn unsubscribe(&self, trigger_id: i64) {
        self.subscribers.remove(trigger_id);
    }
}

pub struct StateChangePlugin {
    triggers: Arc<TriggersPlugin>,
    kind: Arc<StateChangeKind>,
    subscription: Mutex<Option<(SharedEventBus, SubscriptionId)>>,
}

impl StateChangePlugin {
    pub fn new(triggers: Arc<TriggersPlugin>) -> Arc<Self> {
        Arc::new(Self {
            triggers,
            kind: Arc::new(StateChangeKind {
                subscribers: Subscribers::default(),
            }),
            subscription: Mutex::new(None),
        })
    }

    /// Triggers currently subscribed
    pub fn subscriber_count(&self) -> usize {
        self.kind.subscribers.len()
    }
}

#[async_trait]
impl Plugin for StateChangePlugin {
    fn name(&self) -> &str {
        STATE_CHANGE_PLUGIN
    }

    fn kind(&self) -> PluginKind {
        PluginKind::System
    }

    fn depends(&self) -> Vec<String> {
        vec![TRIGGERS_PLUGIN.to_string()]
    }

    async fn load(&self, service: PluginService) -> HubResult<()> {
        let kind = self.kind.clone();
        let id = service
            .bus
            .subscribe(
                topics::ENTITIES,
                handler(move |_, event| {
                    let kind = kind.clone();
                    async move { kind.dispatch(&event) }
                }),
                false,
            )
            .map_err(HubError::internal)?;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some((service.bus.clone(), id));

        if let Err(err) = self.triggers.register(self.kind.clone()) {
            let _ = service.bus.unsubscribe(topics::ENTITIES, id);
            self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
            return Err(err);
        }
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        self.triggers.unregister(STATE_CHANGE_PLUGIN);
        self.kind.subscribers.clear();
        let subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((bus, id)) = subscription {
            bus.unsubscribe(topics::ENTITIES, id).map_err(HubError::internal)?;
        }
        Ok(())
    }
}

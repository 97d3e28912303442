//! `system` trigger kind: fires on service lifecycle events
//!
//! A trigger may narrow itself to one service with `{"service": "<name>"}`
//! in its payload.

use async_trait::async_trait;
use hub_core::models::PluginKind;
use hub_core::{topics, Event, HubError, HubResult};
use hub_event_bus::{handler, SharedEventBus, SubscriptionId};
use hub_supervisor::{Plugin, PluginService};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::kind::{FireMessage, Subscriber, Subscribers, TriggerKind, TriggersPlugin, TRIGGERS_PLUGIN};

pub const SYSTEM_PLUGIN: &str = "system";

struct SystemKind {
    subscribers: Subscribers,
}

impl SystemKind {
    fn dispatch(&self, event: &Event) {
        let service = match event {
            Event::ServiceStarted { service } | Event::ServiceStopped { service } => service,
            _ => return,
        };
        let payload = serde_json::to_value(event).unwrap_or_default();
        let targets = self.subscribers.matching(|s| {
            s.payload
                .get("service")
                .and_then(|v| v.as_str())
                .map_or(true, |wanted| wanted == service)
        });
        for subscriber in targets {
            subscriber.fire(FireMessage {
                entity_id: None,
                payload: payload.clone(),
            });
        }
    }
}

impl TriggerKind for SystemKind {
    fn name(&self) -> &str {
        SYSTEM_PLUGIN
    }

    fn function_name(&self) -> &str {
        "automationTriggerSystem"
    }

    fn subscribe(&self, subscriber: Subscriber) {
        debug!(trigger_id = subscriber.trigger_id, "System trigger subscribed");
        self.subscribers.insert(subscriber);
    }

    fn unsubscribe(&self, trigger_id: i64) {
        self.subscribers.remove(trigger_id);
    }
}

pub struct SystemPlugin {
    triggers: Arc<TriggersPlugin>,
    kind: Arc<SystemKind>,
    subscription: Mutex<Option<(SharedEventBus, SubscriptionId)>>,
}

impl SystemPlugin {
    pub fn new(triggers: Arc<TriggersPlugin>) -> Arc<Self> {
        Arc::new(Self {
            triggers,
            kind: Arc::new(SystemKind {
                subscribers: Subscribers::default(),
            }),
            subscription: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        SYSTEM_PLUGIN
    }

    fn kind(&self) -> PluginKind {
        PluginKind::System
    }

    fn depends(&self) -> Vec<String> {
        vec![TRIGGERS_PLUGIN.to_string()]
    }

    async fn load(&self, service: PluginService) -> HubResult<()> {
        self.triggers.register(self.kind.clone())?;
        let kind = self.kind.clone();
        let id = service
            .bus
            .subscribe(
                topics::SERVICES,
                handler(move |_, event| {
                    let kind = kind.clone();
                    async move { kind.dispatch(&event) }
                }),
                false,
            )
            .map_err(|err| {
                self.triggers.unregister(SYSTEM_PLUGIN);
                HubError::internal(err)
            })?;
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some((service.bus.clone(), id));
        Ok(())
    }

    async fn unload(&self) -> HubResult<()> {
        self.triggers.unregister(SYSTEM_PLUGIN);
        self.kind.subscribers.clear();
        let subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((bus, id)) = subscription {
            bus.unsubscribe(topics::SERVICES, id).map_err(HubError::internal)?;
        }
        Ok(())
    }
}

//! Virtual sensors
//!
//! Entities of the `sensor` plugin have no device behind them. An action
//! with a script runs it; an action named after one of the entity's states
//! moves the entity into that state. A scene without a script applies its
//! arguments as attribute values.

use async_trait::async_trait;
use hub_core::models::PluginKind;
use hub_core::{topics, Event, HubError, HubResult, StateParams};
use hub_supervisor::{ActionHandler, Actor, ActorSet, Plugin, PluginService, ScriptActions};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub const SENSOR_PLUGIN: &str = "sensor";

/// Scripts first, declared states second
pub struct SensorActions;

impl SensorActions {
    async fn set_state(actor: &Actor, params: StateParams) {
        actor
            .bus()
            .publish(
                topics::entity(actor.id()),
                Event::EntitySetState {
                    entity_id: actor.id().clone(),
                    params,
                },
            )
            .await;
    }
}

#[async_trait]
impl ActionHandler for SensorActions {
    async fn call_action(&self, actor: &Actor, action: &str, args: Value) -> HubResult<()> {
        if actor.action_engine(action).is_some() {
            return ScriptActions.call_action(actor, action, args).await;
        }
        if !actor.entity().states.iter().any(|s| s.name == action) {
            return Err(HubError::not_found("action", format!("{}:{action}", actor.id())));
        }
        let mut params = StateParams::state(action);
        if let Value::Object(values) = args {
            params = params.with_attributes(values);
        }
        debug!(entity_id = %actor.id(), action, "Sensor state from action");
        Self::set_state(actor, params).await;
        Ok(())
    }

    async fn call_scene(&self, actor: &Actor, args: Value) -> HubResult<()> {
        if actor.entity_engine().is_some() {
            return ScriptActions.call_scene(actor, args).await;
        }
        match args {
            Value::Object(values) if !values.is_empty() => {
                let params = StateParams {
                    attribute_values: values,
                    ..Default::default()
                };
                Self::set_state(actor, params).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub struct SensorPlugin {
    actors: ActorSet,
}

impl SensorPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            actors: ActorSet::with_handler(SENSOR_PLUGIN, Arc::new(SensorActions)),
        })
    }
}

#[async_trait]
impl Plugin for SensorPlugin {
    fn name(&self) -> &str {
        SENSOR_PLUGIN
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn kind(&self) -> PluginKind {
        PluginKind::BuiltIn
    }

    async fn load(&self, service: PluginService) -> HubResult<()> {
        self.actors.bind(service);
        info!(plugin = SENSOR_PLUGIN, "Virtual sensors ready");
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

//! Trigger engine

mod common;

use common::{eventually, id, next_matching, AutomationHub};
use hub_automation::TriggerState;
use hub_config::AutomationConfig;
use hub_core::models::{Script, Trigger};
use hub_core::{topics, Event, HubError, StateParams};
use hub_script::ScriptEngine;
use std::sync::Arc;

fn door_trigger(trigger_id: i64) -> Trigger {
    Trigger::new("door", "state_change")
        .with_id(trigger_id)
        .with_entity(id("sensorA.device1"))
}

#[tokio::test]
async fn test_duplicate_add_keeps_running_instance() {
    let hub = AutomationHub::new().await;
    hub.trigger_manager.add(door_trigger(1)).await.unwrap();
    let running = hub.trigger_manager.get(1).await.unwrap();

    assert_eq!(
        hub.trigger_manager.add(door_trigger(1)).await,
        Err(HubError::already_exists("trigger", 1))
    );
    assert!(Arc::ptr_eq(&running, &hub.trigger_manager.get(1).await.unwrap()));
    assert_eq!(running.state(), TriggerState::Running);
    assert_eq!(hub.trigger_manager.count(), 1);
}

#[tokio::test]
async fn test_remove_unknown_is_noop() {
    let hub = AutomationHub::new().await;
    hub.trigger_manager.remove(99).await;
    assert_eq!(hub.trigger_manager.count(), 0);

    hub.trigger_manager.add(door_trigger(1)).await.unwrap();
    let running = hub.trigger_manager.get(1).await.unwrap();
    hub.trigger_manager.remove(1).await;
    hub.trigger_manager.remove(1).await;
    assert_eq!(hub.trigger_manager.count(), 0);
    assert_eq!(running.state(), TriggerState::Stopped);
}

#[tokio::test]
async fn test_disabled_add_is_noop() {
    let hub = AutomationHub::new().await;
    hub.trigger_manager.add(door_trigger(1).disabled()).await.unwrap();
    assert!(!hub.trigger_manager.is_loaded(1).await);
    assert_eq!(hub.trigger_manager.count(), 0);
}

#[tokio::test]
async fn test_unknown_kind() {
    let hub = AutomationHub::new().await;
    let trigger = Trigger::new("zigbee button", "zigbee").with_id(2);
    assert_eq!(
        hub.trigger_manager.add(trigger).await,
        Err(HubError::PluginNotLoaded("zigbee".into()))
    );
    assert_eq!(hub.trigger_manager.count(), 0);
}

#[tokio::test]
async fn test_state_change_completes_trigger() {
    let hub = AutomationHub::new().await;
    let device = id("sensorA.device1");
    hub.load_entity(&device).await;
    hub.trigger_manager.add(door_trigger(1)).await.unwrap();
    let mut rx = hub.capture(&topics::trigger(1));

    hub.supervisor.set_state(&id("sensorA.device2"), StateParams::state("ON")).await.ok();
    hub.supervisor.set_state(&device, StateParams::state("ON")).await.unwrap();

    let event = next_matching(&mut rx, |e| matches!(e, Event::TriggerCompleted { .. })).await;
    match event {
        Some(Event::TriggerCompleted { id, entity_id, args }) => {
            assert_eq!(id, 1);
            assert_eq!(entity_id, Some(device));
            assert_eq!(args["type"], "state_changed");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_gates_completion() {
    let hub = AutomationHub::new().await;
    let device = id("sensorA.device1");
    hub.load_entity(&device).await;
    let script = hub
        .script(
            "{% macro automationTriggerStateChanged(msg) -%}\
             {{ msg.payload.new_state.state.name == 'ON' }}\
             {%- endmacro %}",
        )
        .await;
    hub.trigger_manager.add(door_trigger(1).with_script(script)).await.unwrap();
    let trigger = hub.trigger_manager.get(1).await.unwrap();

    hub.supervisor.set_state(&device, StateParams::state("OFF")).await.unwrap();
    assert!(eventually(|| async { trigger.fired() == 1 }).await);
    hub.supervisor.set_state(&device, StateParams::state("ON")).await.unwrap();
    assert!(eventually(|| async { trigger.completed() == 1 }).await);
    assert_eq!(trigger.fired(), 2);
}

#[tokio::test]
async fn test_start_loads_enabled_triggers_in_pages() {
    let hub = AutomationHub::with_config(AutomationConfig { page_size: 1 }).await;
    for name in ["a", "b", "c"] {
        hub.repos.triggers.add(Trigger::new(name, "system")).await.unwrap();
    }
    let off = hub
        .repos
        .triggers
        .add(Trigger::new("off", "system").disabled())
        .await
        .unwrap();

    hub.trigger_manager.start().await.unwrap();
    assert_eq!(hub.trigger_manager.count(), 3);
    assert!(!hub.trigger_manager.is_loaded(off.id).await);
}

#[tokio::test]
async fn test_update_follows_the_record() {
    let hub = AutomationHub::new().await;
    let stored = hub.repos.triggers.add(Trigger::new("boot", "system")).await.unwrap();
    hub.trigger_manager.start().await.unwrap();
    assert!(hub.trigger_manager.is_loaded(stored.id).await);

    let mut record = stored.clone();
    record.enabled = false;
    hub.repos.triggers.update(record).await.unwrap();
    hub.trigger_manager.update(stored.id).await.unwrap();
    assert!(!hub.trigger_manager.is_loaded(stored.id).await);

    hub.bus
        .publish(topics::trigger(stored.id), Event::CommandEnableTrigger { id: stored.id })
        .await;
    let manager = hub.trigger_manager.clone();
    assert!(eventually(|| manager.is_loaded(stored.id)).await);
    assert!(hub.repos.triggers.get_by_id(&stored.id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_model_removal_stops_trigger() {
    let hub = AutomationHub::new().await;
    let stored = hub.repos.triggers.add(Trigger::new("boot", "system")).await.unwrap();
    hub.trigger_manager.start().await.unwrap();

    hub.bus
        .publish(topics::model_trigger(stored.id), Event::RemovedTriggerModel { id: stored.id })
        .await;
    let manager = hub.trigger_manager.clone();
    assert!(eventually(|| async { manager.count() == 0 }).await);
}

#[tokio::test]
async fn test_manual_call_over_the_bus() {
    let hub = AutomationHub::new().await;
    let stored = hub.repos.triggers.add(Trigger::new("boot", "system")).await.unwrap();
    hub.trigger_manager.start().await.unwrap();
    let mut rx = hub.capture(&topics::trigger(stored.id));

    hub.bus
        .publish(topics::trigger(stored.id), Event::CallTrigger { id: stored.id })
        .await;
    let event = next_matching(&mut rx, |e| matches!(e, Event::TriggerCompleted { .. })).await;
    assert!(matches!(
        event,
        Some(Event::TriggerCompleted { ref args, .. }) if args["manual"] == true
    ));
}

#[tokio::test]
async fn test_system_trigger_fires_on_service_events() {
    let hub = AutomationHub::new().await;
    let mut trigger = Trigger::new("hub up", "system").with_id(5);
    trigger.payload = serde_json::json!({"service": "hub"});
    hub.trigger_manager.add(trigger).await.unwrap();
    let mut rx = hub.capture(&topics::trigger(5));

    hub.bus
        .publish(topics::service("hub"), Event::ServiceStarted { service: "hub".into() })
        .await;
    assert!(next_matching(&mut rx, |e| matches!(e, Event::TriggerCompleted { id: 5, .. }))
        .await
        .is_some());
}

#[tokio::test]
async fn test_unloaded_kind_stops_its_triggers() {
    let hub = AutomationHub::new().await;
    hub.repos.triggers.add(Trigger::new("boot", "system")).await.unwrap();
    hub.repos
        .triggers
        .add(door_trigger(0))
        .await
        .unwrap();
    hub.trigger_manager.start().await.unwrap();
    assert_eq!(hub.trigger_manager.count(), 2);

    hub.manager.unload("state_change").await.unwrap();
    let manager = hub.trigger_manager.clone();
    assert!(eventually(|| async { manager.count() == 1 }).await);

    // no retry once the kind is back
    hub.manager.load("state_change").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(hub.trigger_manager.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_capabilities() {
    let hub = AutomationHub::new().await;
    hub.trigger_manager.start().await.unwrap();

    let engine = hub
        .scripts
        .new_engine(&Script::new(
            "setup",
            r#"{{ TriggerAdd({"name": "door", "plugin_name": "state_change", "entity_ids": ["sensorA.device1"]}) }}"#,
        ))
        .unwrap();
    let output = tokio::task::spawn_blocking(move || engine.eval())
        .await
        .unwrap()
        .unwrap();
    let trigger_id: i64 = output.parse().unwrap();
    assert!(hub.trigger_manager.is_loaded(trigger_id).await);
    assert_eq!(hub.repos.triggers.get_by_id(&trigger_id).await.unwrap().name, "door");

    let engine = hub
        .scripts
        .new_engine(&Script::new("bad", r#"{{ TriggerAdd({"name": "", "plugin_name": "state_change"}) }}"#))
        .unwrap();
    let result = tokio::task::spawn_blocking(move || engine.eval()).await.unwrap();
    assert!(result.unwrap_err().to_string().contains("name"));

    let source = format!("{{{{ TriggerDelete({trigger_id}) }}}}");
    let engine = hub.scripts.new_engine(&Script::new("cleanup", source)).unwrap();
    tokio::task::spawn_blocking(move || engine.eval()).await.unwrap().unwrap();
    assert!(!hub.trigger_manager.is_loaded(trigger_id).await);
    assert!(hub.repos.triggers.get_by_id(&trigger_id).await.is_err());
}

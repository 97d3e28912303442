//! Task engine

mod common;

use common::{eventually, id, AutomationHub};
use hub_core::models::{Action, Condition, ConditionType, Task, Trigger};
use hub_core::{topics, Event, HubError, StateParams};

const YES: &str = "{% macro automationCondition(entity_id) %}true{% endmacro %}";
const NO: &str = "{% macro automationCondition(entity_id) %}false{% endmacro %}";

async fn condition(hub: &AutomationHub, source: &str) -> i64 {
    let script = hub.script(source).await;
    hub.repos
        .conditions
        .add(Condition::new("check").with_script(script))
        .await
        .unwrap()
        .id
}

async fn action(hub: &AutomationHub, model: Action) -> i64 {
    hub.repos.actions.add(model).await.unwrap().id
}

/// Task with one true and one false condition and two entity actions
async fn mixed_task(hub: &AutomationHub, kind: ConditionType) -> i64 {
    let device = id("sensorA.device1");
    hub.load_entity(&device).await;
    let mut task = Task::new("lights", kind);
    task.condition_ids = vec![condition(hub, YES).await, condition(hub, NO).await];
    task.action_ids = vec![
        action(hub, Action::new("on").call(device.clone(), "ON")).await,
        action(hub, Action::new("dim").call(device, "DIM")).await,
    ];
    hub.repos.tasks.add(task).await.unwrap().id
}

#[tokio::test]
async fn test_and_with_a_false_condition_runs_nothing() {
    let hub = AutomationHub::new().await;
    let task_id = mixed_task(&hub, ConditionType::And).await;
    hub.task_manager.start().await.unwrap();

    let task = hub.task_manager.get(task_id).await.unwrap();
    assert!(!task.run(None).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(hub.recorder.count(), 0);
}

#[tokio::test]
async fn test_or_runs_every_action_once() {
    let hub = AutomationHub::new().await;
    let task_id = mixed_task(&hub, ConditionType::Or).await;
    hub.task_manager.start().await.unwrap();

    let task = hub.task_manager.get(task_id).await.unwrap();
    assert!(task.run(None).await);

    let recorder = hub.recorder.clone();
    assert!(eventually(|| async { recorder.count() == 2 }).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        hub.recorder.calls(),
        vec!["sensorA.device1:ON", "sensorA.device1:DIM"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_action_script_passes_args() {
    let hub = AutomationHub::new().await;
    let lamp = id("sensorA.device2");
    hub.load_entity(&lamp).await;
    let script = hub
        .script(
            "{% macro automationAction(entity_id) -%}\
             {% set _ = EntityCallAction('sensorA.device2', 'DIM', {'level': 40}) %}\
             {%- endmacro %}",
        )
        .await;
    let mut task = Task::new("dim lamp", ConditionType::And);
    task.action_ids = vec![action(&hub, Action::new("dim").with_script(script)).await];
    let task_id = hub.repos.tasks.add(task).await.unwrap().id;
    hub.task_manager.start().await.unwrap();

    assert!(hub.task_manager.get(task_id).await.unwrap().run(None).await);
    let recorder = hub.recorder.clone();
    assert!(eventually(|| async { recorder.count() == 1 }).await);
    assert_eq!(hub.recorder.calls(), vec!["sensorA.device2:DIM"]);
    assert_eq!(hub.recorder.args(), vec![serde_json::json!({ "level": 40 })]);
}

#[tokio::test]
async fn test_condition_without_script_holds() {
    let hub = AutomationHub::new().await;
    let device = id("sensorA.device1");
    hub.load_entity(&device).await;
    let plain = hub.repos.conditions.add(Condition::new("always")).await.unwrap().id;
    let mut task = Task::new("scene", ConditionType::And);
    task.condition_ids = vec![plain];
    task.action_ids = vec![action(&hub, Action::new("scene").scene(device)).await];
    let task_id = hub.repos.tasks.add(task).await.unwrap().id;
    hub.task_manager.start().await.unwrap();

    assert!(hub.task_manager.get(task_id).await.unwrap().run(None).await);
    let recorder = hub.recorder.clone();
    assert!(eventually(|| async { recorder.calls() == vec!["sensorA.device1:scene"] }).await);
}

#[tokio::test]
async fn test_trigger_completion_runs_task() {
    let hub = AutomationHub::new().await;
    let door = id("sensorA.device1");
    let lamp = id("sensorA.device2");
    hub.load_entity(&door).await;
    hub.load_entity(&lamp).await;

    let trigger = hub
        .repos
        .triggers
        .add(Trigger::new("door opened", "state_change").with_entity(door.clone()))
        .await
        .unwrap();
    let mut task = Task::new("hall light", ConditionType::And);
    task.trigger_ids = vec![trigger.id];
    task.action_ids = vec![action(&hub, Action::new("lamp on").call(lamp, "ON")).await];
    hub.repos.tasks.add(task).await.unwrap();

    hub.trigger_manager.start().await.unwrap();
    hub.task_manager.start().await.unwrap();
    hub.supervisor.set_state(&door, StateParams::state("OPEN")).await.unwrap();

    let recorder = hub.recorder.clone();
    assert!(eventually(|| async { recorder.calls() == vec!["sensorA.device2:ON"] }).await);
}

#[tokio::test]
async fn test_duplicate_and_disabled_tasks() {
    let hub = AutomationHub::new().await;
    let task = hub
        .repos
        .tasks
        .add(Task::new("idle", ConditionType::And))
        .await
        .unwrap();
    hub.task_manager.add(task.clone()).await.unwrap();
    assert_eq!(
        hub.task_manager.add(task.clone()).await,
        Err(HubError::already_exists("task", task.id))
    );

    let mut off = Task::new("off", ConditionType::Or);
    off.enabled = false;
    let off = hub.repos.tasks.add(off).await.unwrap();
    hub.task_manager.add(off.clone()).await.unwrap();
    assert!(!hub.task_manager.is_loaded(off.id).await);
    assert_eq!(hub.task_manager.count().await, 1);
}

#[tokio::test]
async fn test_disable_command_persists() {
    let hub = AutomationHub::new().await;
    let task = hub
        .repos
        .tasks
        .add(Task::new("idle", ConditionType::And))
        .await
        .unwrap();
    hub.task_manager.start().await.unwrap();
    assert!(hub.task_manager.is_loaded(task.id).await);

    hub.bus
        .publish(topics::task(task.id), Event::CommandDisableTask { id: task.id })
        .await;
    let repos = hub.repos.clone();
    assert!(
        eventually(|| {
            let repos = repos.clone();
            async move { !repos.tasks.get_by_id(&task.id).await.unwrap().enabled }
        })
        .await
    );
    assert!(!hub.task_manager.is_loaded(task.id).await);

    hub.bus
        .publish(topics::task(task.id), Event::CommandEnableTask { id: task.id })
        .await;
    let manager = hub.task_manager.clone();
    assert!(eventually(|| manager.is_loaded(task.id)).await);
}

#[tokio::test]
async fn test_call_action_by_id() {
    let hub = AutomationHub::new().await;
    let device = id("sensorA.device1");
    hub.load_entity(&device).await;
    let action_id = action(&hub, Action::new("toggle").call(device, "TOGGLE")).await;
    hub.task_manager.start().await.unwrap();

    hub.bus
        .publish(topics::action(action_id), Event::CallAction { id: action_id })
        .await;
    let recorder = hub.recorder.clone();
    assert!(eventually(|| async { recorder.calls() == vec!["sensorA.device1:TOGGLE"] }).await);
}

#[tokio::test]
async fn test_missing_condition_fails_add() {
    let hub = AutomationHub::new().await;
    let mut task = Task::new("broken", ConditionType::And);
    task.condition_ids = vec![404];
    let task = hub.repos.tasks.add(task).await.unwrap();
    assert!(hub.task_manager.add(task).await.unwrap_err().is_not_found());
}

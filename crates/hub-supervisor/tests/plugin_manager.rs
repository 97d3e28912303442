//! Plugin manager lifecycle

mod common;

use common::{next_matching, CountingPlugin, TestHub};
use hub_config::{PluginsConfig, SupervisorConfig};
use hub_core::models::{PluginKind, PluginRecord};
use hub_core::{topics, Event, HubError};
use hub_supervisor::{PluginState, SharedPlugin};

fn plugins(list: &[&std::sync::Arc<CountingPlugin>]) -> Vec<SharedPlugin> {
    list.iter().map(|p| (*p).clone() as SharedPlugin).collect()
}

#[tokio::test]
async fn test_load_twice_reports_already_loaded() {
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&sensor]));

    hub.manager.load("sensor").await.unwrap();
    assert_eq!(
        hub.manager.load("sensor").await,
        Err(HubError::AlreadyLoaded("sensor".into()))
    );

    assert_eq!(sensor.loads(), 1);
    assert_eq!(hub.manager.loaded_count(), 1);
    assert_eq!(hub.manager.state("sensor").await, PluginState::Loaded);
}

#[tokio::test]
async fn test_unload_of_not_loaded_plugin() {
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&sensor]));

    assert_eq!(
        hub.manager.unload("sensor").await,
        Err(HubError::PluginNotLoaded("sensor".into()))
    );
    assert_eq!(hub.manager.loaded_count(), 0);

    hub.manager.load("sensor").await.unwrap();
    hub.manager.unload("sensor").await.unwrap();
    assert!(matches!(
        hub.manager.unload("sensor").await,
        Err(HubError::PluginNotLoaded(_))
    ));
    assert_eq!(hub.manager.loaded_count(), 0);
    assert_eq!(sensor.unloads(), 1);
}

#[tokio::test]
async fn test_unknown_plugin() {
    let hub = TestHub::new(vec![]);
    assert!(hub.manager.load("zigbee").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_load_can_be_retried() {
    let broken = CountingPlugin::build("broken", PluginKind::BuiltIn, &[], true);
    let hub = TestHub::new(plugins(&[&broken]));

    assert!(matches!(hub.manager.load("broken").await, Err(HubError::Internal(_))));
    assert_eq!(hub.manager.state("broken").await, PluginState::NotLoaded);
    assert_eq!(hub.manager.loaded_count(), 0);

    assert!(hub.manager.load("broken").await.is_err());
    assert_eq!(broken.loads(), 2);
}

#[tokio::test]
async fn test_dependency_must_be_loaded_first() {
    let triggers = CountingPlugin::build("triggers", PluginKind::System, &[], false);
    let state_change = CountingPlugin::build("state_change", PluginKind::BuiltIn, &["triggers"], false);
    let hub = TestHub::new(plugins(&[&triggers, &state_change]));

    assert_eq!(
        hub.manager.load("state_change").await,
        Err(HubError::PluginNotLoaded("triggers".into()))
    );
    assert_eq!(state_change.loads(), 0);

    hub.manager.load("triggers").await.unwrap();
    hub.manager.load("state_change").await.unwrap();
    assert_eq!(hub.manager.loaded_count(), 2);
}

#[tokio::test]
async fn test_loaded_and_unloaded_events() {
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&sensor]));
    let mut rx = hub.capture(topics::PLUGINS);

    hub.manager.load("sensor").await.unwrap();
    hub.manager.unload("sensor").await.unwrap();

    let loaded = next_matching(&mut rx, |e| matches!(e, Event::PluginLoaded { .. })).await;
    assert_eq!(
        loaded,
        Some(Event::PluginLoaded {
            plugin_name: "sensor".into()
        })
    );
    assert!(next_matching(&mut rx, |e| matches!(e, Event::PluginUnloaded { .. }))
        .await
        .is_some());
}

#[tokio::test]
async fn test_start_loads_enabled_plugins_in_pages() {
    let triggers = CountingPlugin::build("triggers", PluginKind::System, &[], false);
    let state_change = CountingPlugin::build("state_change", PluginKind::BuiltIn, &["triggers"], false);
    let sensor = CountingPlugin::new("sensor");
    let idle = CountingPlugin::new("idle");
    let orphan = CountingPlugin::build("orphan", PluginKind::BuiltIn, &["missing"], false);
    let hub = TestHub::with_config(
        plugins(&[&triggers, &state_change, &sensor, &idle, &orphan]),
        PluginsConfig {
            page_size: 1,
            ..PluginsConfig::default()
        },
        SupervisorConfig::default(),
    );

    for (name, enabled) in [("state_change", true), ("sensor", true), ("idle", false), ("orphan", true), ("ghost", true)] {
        let mut record = PluginRecord::new(name, "1.0.0");
        record.enabled = enabled;
        hub.repos.plugins.add(record).await.unwrap();
    }

    hub.manager.start().await.unwrap();

    // triggers was seeded as a system plugin and loaded before its dependent
    assert!(hub.repos.plugins.get_by_id(&"triggers".to_string()).await.unwrap().enabled);
    assert!(hub.manager.is_loaded("triggers").await);
    assert!(hub.manager.is_loaded("state_change").await);
    assert!(hub.manager.is_loaded("sensor").await);
    assert!(!hub.manager.is_loaded("idle").await);
    assert!(!hub.manager.is_loaded("orphan").await);
    assert_eq!(orphan.loads(), 0);
    assert_eq!(hub.manager.loaded_count(), 3);
}

#[tokio::test]
async fn test_shutdown_unloads_everything_and_drains() {
    let triggers = CountingPlugin::build("triggers", PluginKind::System, &[], false);
    let state_change = CountingPlugin::build("state_change", PluginKind::BuiltIn, &["triggers"], false);
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&triggers, &state_change, &sensor]));

    hub.manager.load("triggers").await.unwrap();
    hub.manager.load("state_change").await.unwrap();
    hub.manager.load("sensor").await.unwrap();

    tokio::time::timeout(common::WAIT, hub.manager.shutdown())
        .await
        .expect("shutdown drained");

    assert_eq!(hub.manager.loaded_count(), 0);
    assert!(hub.manager.loaded_names().await.is_empty());
    for plugin in [&triggers, &state_change, &sensor] {
        assert_eq!(plugin.unloads(), 1);
    }
}

#[tokio::test]
async fn test_install_and_uninstall() {
    let weather = CountingPlugin::build("weather", PluginKind::Installable, &[], false);
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&weather, &sensor]));

    hub.manager.install("weather").await.unwrap();
    assert!(hub.manager.is_loaded("weather").await);
    let record = hub.repos.plugins.get_by_id(&"weather".to_string()).await.unwrap();
    assert!(record.enabled && record.external);

    // installing again is a no-op
    hub.manager.install("weather").await.unwrap();
    assert_eq!(weather.installs.load(std::sync::atomic::Ordering::SeqCst), 1);

    hub.manager.uninstall("weather").await.unwrap();
    assert!(!hub.manager.is_loaded("weather").await);
    assert!(!hub.repos.plugins.get_by_id(&"weather".to_string()).await.unwrap().enabled);
    assert_eq!(weather.uninstalls.load(std::sync::atomic::Ordering::SeqCst), 1);

    assert!(matches!(hub.manager.install("sensor").await, Err(HubError::Validation(_))));
}

#[tokio::test]
async fn test_enable_disable_persist_flag() {
    let sensor = CountingPlugin::new("sensor");
    let hub = TestHub::new(plugins(&[&sensor]));

    hub.manager.enable_plugin("sensor").await.unwrap();
    let info = hub.manager.plugin_info("sensor").await.unwrap();
    assert!(info.loaded && info.enabled);

    hub.manager.disable_plugin("sensor").await.unwrap();
    let list = hub.manager.plugin_list().await.unwrap();
    assert_eq!(list.len(), 1);
    assert!(!list[0].loaded && !list[0].enabled);
}

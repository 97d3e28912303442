//! Built-in leaf plugins
//!
//! These ship with the hub and need nothing but the core: no child process,
//! no hardware.

mod sensor;

use hub_supervisor::SharedPlugin;

pub use sensor::{SensorActions, SensorPlugin, SENSOR_PLUGIN};

/// Every built-in leaf plugin, ready for a registry
pub fn builtin() -> Vec<SharedPlugin> {
    vec![SensorPlugin::new() as SharedPlugin]
}

//! Persisted records

mod area;
mod attributes;
mod automation;
mod entity;
mod plugin;
mod script;

pub use area::{Area, Point};
pub use attributes::{Attribute, AttributeType, AttributeValues, Attributes, MergeOutcome};
pub use automation::{Action, Condition, ConditionType, Task, Trigger};
pub use entity::{Entity, EntityAction, EntityState, EntityStorage};
pub use plugin::{PluginInfo, PluginKind, PluginOptions, PluginRecord};
pub use script::Script;

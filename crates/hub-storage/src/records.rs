//! Record impls for the core models

use hub_core::models::{
    Action, Area, Condition, Entity, EntityStorage, PluginRecord, Script, Task, Trigger,
};
use hub_core::EntityId;

use crate::Record;

impl Record for Entity {
    type Key = EntityId;
    const KIND: &'static str = "entity";

    fn key(&self) -> EntityId {
        self.id.clone()
    }

    fn name(&self) -> &str {
        self.id.name()
    }

    fn enabled(&self) -> Option<bool> {
        Some(self.auto_load)
    }

    fn group(&self) -> Option<&str> {
        Some(self.id.plugin_name())
    }

    fn search_text(&self) -> String {
        format!("{} {}", self.id, self.description).to_lowercase()
    }
}

impl Record for EntityStorage {
    type Key = i64;
    const KIND: &'static str = "entity_storage";

    fn key(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        self.state.as_deref().unwrap_or_default()
    }

    fn id_slot(&mut self) -> Option<&mut i64> {
        Some(&mut self.id)
    }

    fn group(&self) -> Option<&str> {
        Some(self.entity_id.plugin_name())
    }

    fn search_text(&self) -> String {
        self.entity_id.to_string().to_lowercase()
    }
}

impl Record for PluginRecord {
    type Key = String;
    const KIND: &'static str = "plugin";

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> Option<bool> {
        Some(self.enabled)
    }
}

macro_rules! numbered_record {
    ($ty:ty, $kind:literal $(, enabled = $enabled:ident)?) => {
        impl Record for $ty {
            type Key = i64;
            const KIND: &'static str = $kind;

            fn key(&self) -> i64 {
                self.id
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn id_slot(&mut self) -> Option<&mut i64> {
                Some(&mut self.id)
            }

            $(
                fn enabled(&self) -> Option<bool> {
                    Some(self.$enabled)
                }
            )?
        }
    };
}

numbered_record!(Script, "script");
numbered_record!(Trigger, "trigger", enabled = enabled);
numbered_record!(Task, "task", enabled = enabled);
numbered_record!(Condition, "condition");
numbered_record!(Action, "action");
numbered_record!(Area, "area");

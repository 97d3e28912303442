//! Reverse index from scripts to the entities running them

use dashmap::DashMap;
use hub_core::models::Entity;
use hub_core::EntityId;
use std::collections::BTreeSet;

#[derive(Default)]
pub struct ScriptWatcher {
    dependents: DashMap<i64, BTreeSet<EntityId>>,
    scripts: DashMap<EntityId, Vec<i64>>,
}

impl ScriptWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace what `entity` depends on
    pub fn record(&self, entity: &Entity) {
        self.forget(&entity.id);
        let script_ids = entity.all_script_ids();
        for script_id in &script_ids {
            self.dependents
                .entry(*script_id)
                .or_default()
                .insert(entity.id.clone());
        }
        if !script_ids.is_empty() {
            self.scripts.insert(entity.id.clone(), script_ids);
        }
    }

    pub fn forget(&self, entity_id: &EntityId) {
        let Some((_, script_ids)) = self.scripts.remove(entity_id) else {
            return;
        };
        for script_id in script_ids {
            if let Some(mut set) = self.dependents.get_mut(&script_id) {
                set.remove(entity_id);
            }
            self.dependents.remove_if(&script_id, |_, set| set.is_empty());
        }
    }

    pub fn forget_plugin(&self, plugin: &str) {
        let ids: Vec<EntityId> = self
            .scripts
            .iter()
            .filter(|e| e.key().plugin_name() == plugin)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.forget(&id);
        }
    }

    pub fn dependents(&self, script_id: i64) -> Vec<EntityId> {
        self.dependents
            .get(&script_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

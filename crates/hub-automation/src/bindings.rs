//! `TriggerAdd`, `TriggerUpdate` and `TriggerDelete` for scripts

use hub_core::models::Trigger;
use hub_script::{failed, Capability, CapabilityResult};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

use crate::manager::TriggerManager;

#[derive(Clone)]
struct Ctx {
    manager: Weak<TriggerManager>,
    handle: Handle,
}

impl Ctx {
    fn get(&self, name: &str) -> CapabilityResult<Arc<TriggerManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| failed(name, "trigger engine stopped"))
    }
}

pub fn capabilities(manager: Weak<TriggerManager>, handle: Handle) -> Vec<Capability> {
    let ctx = Ctx { manager, handle };
    let mut list = Vec::new();

    // returns the id of the stored trigger; field errors are reported as the message
    let c = ctx.clone();
    list.push(Capability::typed1("TriggerAdd", move |model: Trigger| {
        let m = c.get("TriggerAdd")?;
        let stored = c
            .handle
            .block_on(m.create(model))
            .map_err(|e| failed("TriggerAdd", e))?;
        Ok(stored.id)
    }));

    let c = ctx.clone();
    list.push(Capability::typed1("TriggerUpdate", move |id: i64| {
        let m = c.get("TriggerUpdate")?;
        c.handle
            .block_on(m.update(id))
            .map_err(|e| failed("TriggerUpdate", e))
    }));

    let c = ctx;
    list.push(Capability::typed1("TriggerDelete", move |id: i64| {
        let m = c.get("TriggerDelete")?;
        c.handle
            .block_on(m.delete(id))
            .map_err(|e| failed("TriggerDelete", e))
    }));

    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_script::CapabilityError;
    use serde_json::json;

    #[test]
    fn test_bad_model_is_an_argument_error() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let caps = capabilities(Weak::new(), runtime.handle().clone());
        let add = caps.iter().find(|c| c.name() == "TriggerAdd").unwrap();
        assert!(matches!(
            add.call(&[json!({"description": "no name"})]),
            Err(CapabilityError::BadArgument { index: 0, .. })
        ));
        assert!(matches!(
            add.call(&[json!({"name": "door", "plugin_name": "state_change"})]),
            Err(CapabilityError::Failed { .. })
        ));
    }
}

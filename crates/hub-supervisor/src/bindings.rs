//! Script capabilities backed by the supervisor
//!
//! Scripts run on blocking threads, so each capability drives the async
//! supervisor call to completion on the captured runtime handle.

use hub_core::models::{AttributeValues, Point};
use hub_core::{EntityId, StateParams};
use hub_script::{failed, Arity, Capability, CapabilityError, CapabilityResult};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

use crate::geo;
use crate::supervisor::{ActionSelector, Supervisor};

fn arg<T: DeserializeOwned>(name: &str, args: &[Value], index: usize) -> CapabilityResult<T> {
    serde_json::from_value(args.get(index).cloned().unwrap_or(Value::Null)).map_err(|e| {
        CapabilityError::BadArgument {
            name: name.to_string(),
            index,
            message: e.to_string(),
        }
    })
}

#[derive(Clone)]
struct Ctx {
    supervisor: Weak<Supervisor>,
    handle: Handle,
}

impl Ctx {
    fn get(&self, name: &str) -> CapabilityResult<Arc<Supervisor>> {
        self.supervisor
            .upgrade()
            .ok_or_else(|| failed(name, "supervisor stopped"))
    }
}

/// Every capability the supervisor exposes
pub fn capabilities(supervisor: Weak<Supervisor>, handle: Handle) -> Vec<Capability> {
    let ctx = Ctx { supervisor, handle };
    let mut list = Vec::new();

    let c = ctx.clone();
    list.push(Capability::typed2(
        "EntitySetState",
        move |entity_id: EntityId, params: StateParams| {
            let s = c.get("EntitySetState")?;
            c.handle
                .block_on(s.set_state(&entity_id, params))
                .map_err(|e| failed("EntitySetState", e))
        },
    ));

    let c = ctx.clone();
    list.push(Capability::typed2(
        "EntitySetStateName",
        move |entity_id: EntityId, state: String| {
            let s = c.get("EntitySetStateName")?;
            c.handle
                .block_on(s.set_state(&entity_id, StateParams::state(state)))
                .map_err(|e| failed("EntitySetStateName", e))
        },
    ));

    let c = ctx.clone();
    list.push(Capability::typed1("EntityGetState", move |entity_id: EntityId| {
        let s = c.get("EntityGetState")?;
        let actor = c
            .handle
            .block_on(s.get_actor_by_id(&entity_id))
            .map_err(|e| failed("EntityGetState", e))?;
        Ok(actor.state_name())
    }));

    let c = ctx.clone();
    list.push(Capability::typed2(
        "EntitySetAttributes",
        move |entity_id: EntityId, values: AttributeValues| {
            let s = c.get("EntitySetAttributes")?;
            c.handle
                .block_on(s.set_state(&entity_id, StateParams::default().with_attributes(values)))
                .map_err(|e| failed("EntitySetAttributes", e))
        },
    ));

    let c = ctx.clone();
    list.push(Capability::typed1("EntityGetAttributes", move |entity_id: EntityId| {
        let s = c.get("EntityGetAttributes")?;
        let actor = c
            .handle
            .block_on(s.get_actor_by_id(&entity_id))
            .map_err(|e| failed("EntityGetAttributes", e))?;
        Ok(actor.attributes())
    }));

    let c = ctx.clone();
    list.push(Capability::typed1("EntityGetSettings", move |entity_id: EntityId| {
        let s = c.get("EntityGetSettings")?;
        let actor = c
            .handle
            .block_on(s.get_actor_by_id(&entity_id))
            .map_err(|e| failed("EntityGetSettings", e))?;
        Ok(actor.settings())
    }));

    let c = ctx.clone();
    list.push(Capability::new("EntityCallAction", Arity::Between(2, 3), move |args| {
        const NAME: &str = "EntityCallAction";
        let entity_id: EntityId = arg(NAME, args, 0)?;
        let action: String = arg(NAME, args, 1)?;
        let payload: Value = arg(NAME, args, 2)?;
        let s = c.get(NAME)?;
        c.handle
            .block_on(s.call_action(&entity_id, &action, payload))
            .map_err(|e| failed(NAME, e))?;
        Ok(Value::Null)
    }));

    let c = ctx.clone();
    list.push(Capability::new("EntitiesCallAction", Arity::Between(2, 3), move |args| {
        const NAME: &str = "EntitiesCallAction";
        let selector: ActionSelector = arg(NAME, args, 0)?;
        let action: String = arg(NAME, args, 1)?;
        let payload: Value = arg(NAME, args, 2)?;
        let s = c.get(NAME)?;
        let count = c
            .handle
            .block_on(s.call_action_v2(&selector, &action, payload))
            .map_err(|e| failed(NAME, e))?;
        Ok(json!(count))
    }));

    let c = ctx.clone();
    list.push(Capability::typed1_opt(
        "EntityCallScene",
        move |entity_id: EntityId, args: Value| {
            let s = c.get("EntityCallScene")?;
            c.handle
                .block_on(s.call_scene(&entity_id, args))
                .map_err(|e| failed("EntityCallScene", e))
        },
    ));

    let c = ctx.clone();
    list.push(Capability::typed2(
        "EntityCallScript",
        move |entity_id: EntityId, script_id: i64| {
            const NAME: &str = "EntityCallScript";
            let s = c.get(NAME)?;
            let script = c
                .handle
                .block_on(s.repos().scripts.get_by_id(&script_id))
                .map_err(|e| failed(NAME, e))?;
            let engine = s.scripts().new_engine(&script).map_err(|e| failed(NAME, e))?;
            engine
                .push_struct("ENTITY_ID", json!(entity_id.to_string()))
                .map_err(|e| failed(NAME, e))?;
            engine.eval().map_err(|e| failed(NAME, e))
        },
    ));

    list.push(Capability::typed2(
        "GeoDistanceBetweenPoints",
        |a: Point, b: Point| Ok(geo::distance(&a, &b)),
    ));

    let c = ctx.clone();
    list.push(Capability::typed2(
        "GeoPointInsideArea",
        move |area_id: i64, point: Point| {
            let s = c.get("GeoPointInsideArea")?;
            let area = c
                .handle
                .block_on(s.repos().areas.get_by_id(&area_id))
                .map_err(|e| failed("GeoPointInsideArea", e))?;
            Ok(geo::contains(&area.polygon, &point))
        },
    ));

    let c = ctx.clone();
    list.push(Capability::typed2(
        "GeoDistanceToArea",
        move |area_id: i64, point: Point| {
            let s = c.get("GeoDistanceToArea")?;
            let area = c
                .handle
                .block_on(s.repos().areas.get_by_id(&area_id))
                .map_err(|e| failed("GeoDistanceToArea", e))?;
            let center = area
                .center()
                .ok_or_else(|| failed("GeoDistanceToArea", format!("area {area_id} has no shape")))?;
            Ok(geo::distance(&center, &point))
        },
    ));

    let c = ctx;
    list.push(Capability::typed1_opt(
        "PushSystemEvent",
        move |command: String, params: Map<String, Value>| {
            let s = c.get("PushSystemEvent")?;
            c.handle
                .block_on(s.push_system_event(&command, params))
                .map_err(|e| failed("PushSystemEvent", e))
        },
    ));

    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let caps = capabilities(Weak::new(), runtime.handle().clone());
        let mut names: Vec<&str> = caps.iter().map(|c| c.name()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(names.contains(&"EntitySetState"));
        assert!(names.contains(&"GeoPointInsideArea"));
    }

    #[test]
    fn test_pure_geo_capability() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let caps = capabilities(Weak::new(), runtime.handle().clone());
        let distance = caps
            .iter()
            .find(|c| c.name() == "GeoDistanceBetweenPoints")
            .unwrap();
        let out = distance
            .call(&[json!({"lat": 0.0, "lon": 0.0}), json!({"lat": 0.0, "lon": 0.0})])
            .unwrap();
        assert_eq!(out, json!(0.0));
    }

    #[test]
    fn test_stopped_supervisor() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let caps = capabilities(Weak::new(), runtime.handle().clone());
        let get_state = caps.iter().find(|c| c.name() == "EntityGetState").unwrap();
        assert!(matches!(
            get_state.call(&[json!("sensor.a")]),
            Err(CapabilityError::Failed { .. })
        ));
    }
}

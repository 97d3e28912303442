use hub_core::models::Script;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{Capability, CapabilityTable};
use crate::engine::{JinjaEngine, ScriptEngine};
use crate::error::{ScriptError, ScriptResult};

pub type SharedEngine = Arc<dyn ScriptEngine>;

/// Run a script function on a blocking thread
///
/// Capabilities may block on async work, so scripts never run on a runtime
/// worker. A panic inside the script comes back as a runtime error.
pub async fn call_blocking(engine: SharedEngine, name: &str, args: Vec<Value>) -> ScriptResult<String> {
    call_blocking_holding(engine, name, args, ()).await
}

/// [`call_blocking`], keeping `guard` alive until the script returns
///
/// Dropping the returned future does not stop the blocking thread; the
/// guard is what lets an owner wait for it.
pub async fn call_blocking_holding<G>(engine: SharedEngine, name: &str, args: Vec<Value>, guard: G) -> ScriptResult<String>
where
    G: Send + 'static,
{
    let function = name.to_string();
    let script_id = engine.script_id();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        engine.assert_function(&function, &args)
    })
    .await
    .unwrap_or_else(|err| {
        Err(ScriptError::Runtime {
            script: script_id.to_string(),
            message: if err.is_panic() {
                format!("{name} panicked")
            } else {
                format!("{name} cancelled")
            },
        })
    })
}

/// Creates engines and owns the process wide capability table
#[derive(Clone, Default)]
pub struct ScriptService {
    capabilities: Arc<CapabilityTable>,
}

impl ScriptService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        &self.capabilities
    }

    /// Register a capability for every engine, current and future
    pub fn push_function(&self, capability: Capability) -> ScriptResult<()> {
        debug!(name = capability.name(), arity = %capability.arity(), "Binding script capability");
        self.capabilities.register(capability)?;
        Ok(())
    }

    /// Register a batch, logging the ones that fail
    pub fn push_functions(&self, capabilities: impl IntoIterator<Item = Capability>) {
        for capability in capabilities {
            let name = capability.name().to_string();
            if let Err(err) = self.push_function(capability) {
                warn!(name = %name, error = %err, "Capability not bound");
            }
        }
    }

    pub fn pop_function(&self, name: &str) {
        self.capabilities.unregister(name);
    }

    pub fn push_struct(&self, name: &str, value: Value) -> ScriptResult<()> {
        self.capabilities.set_value(name, value)?;
        Ok(())
    }

    /// Compile `script` into a ready engine
    pub fn new_engine(&self, script: &Script) -> ScriptResult<SharedEngine> {
        if script.lang != "jinja" {
            return Err(ScriptError::UnsupportedLang(script.lang.clone()));
        }
        let engine = JinjaEngine::new(
            script.id,
            script.name.clone(),
            script.source.clone(),
            self.capabilities.clone(),
        );
        engine.compile()?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_engine_compiles() {
        let service = ScriptService::new();
        let ok = Script::new("ok", "{% macro f() %}1{% endmacro %}");
        assert!(service.new_engine(&ok).is_ok());

        let broken = Script::new("broken", "{% if %}");
        assert!(matches!(
            service.new_engine(&broken),
            Err(ScriptError::Compile { .. })
        ));

        let mut lua = Script::new("lua", "print(1)");
        lua.lang = "lua".into();
        assert!(matches!(
            service.new_engine(&lua),
            Err(ScriptError::UnsupportedLang(_))
        ));
    }

    #[tokio::test]
    async fn test_call_blocking_recovers_panics() {
        let service = ScriptService::new();
        service
            .push_function(Capability::typed0("Explode", || -> crate::CapabilityResult<()> {
                panic!("boom")
            }))
            .unwrap();
        let engine = service
            .new_engine(&Script::new(
                "s",
                "{% macro ok(x) %}{{ x }}{% endmacro %}{% macro bad() %}{{ Explode() }}{% endmacro %}",
            ))
            .unwrap();

        let err = call_blocking(engine.clone(), "bad", vec![]).await.unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { .. }));
        let out = call_blocking(engine, "ok", vec![serde_json::json!(7)]).await.unwrap();
        assert_eq!(out, "7");
    }

    #[test]
    fn test_global_capability_visible_to_engines() {
        let service = ScriptService::new();
        service
            .push_function(Capability::typed0("Site", || Ok("home")))
            .unwrap();
        let engine = service
            .new_engine(&Script::new("s", "{% macro f() %}{{ Site() }}{% endmacro %}"))
            .unwrap();
        assert_eq!(engine.assert_function("f", &[]).unwrap(), "home");

        service.pop_function("Site");
        assert!(engine.assert_function("f", &[]).is_err());
    }
}

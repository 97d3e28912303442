//! Script engine backed by minijinja
//!
//! A script is a template whose macros are the callable functions:
//!
//! ```jinja
//! {% macro entityAction(entity_id, action, args) -%}
//!   {% set _ = EntitySetState(entity_id, {"new_state": action}) %}
//! {%- endmacro %}
//! ```
//!
//! Registered capabilities become global functions, pushed values become
//! global variables.

use minijinja::value::Rest;
use minijinja::{Environment, Error, ErrorKind, Value};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::capability::{Capability, CapabilityTable};
use crate::error::{ScriptError, ScriptResult};

const TEMPLATE_NAME: &str = "script";

/// What the core needs from a compiled script
pub trait ScriptEngine: Send + Sync {
    /// Id of the script record this engine runs
    fn script_id(&self) -> i64;

    /// Parse the source, reporting syntax errors
    fn compile(&self) -> ScriptResult<()>;

    /// Call a script function and return its trimmed output
    fn assert_function(&self, name: &str, args: &[JsonValue]) -> ScriptResult<String>;

    fn has_function(&self, name: &str) -> bool;

    /// Render the top level of the script
    fn eval(&self) -> ScriptResult<String>;

    /// Function visible to this engine only
    fn push_function(&self, capability: Capability) -> ScriptResult<()>;

    /// Value visible to this engine only
    fn push_struct(&self, name: &str, value: JsonValue) -> ScriptResult<()>;
}

struct Compiled {
    generation: u64,
    env: Arc<Environment<'static>>,
}

pub struct JinjaEngine {
    script_id: i64,
    script_name: String,
    source: String,
    shared: Arc<CapabilityTable>,
    local: CapabilityTable,
    compiled: Mutex<Option<Compiled>>,
}

impl JinjaEngine {
    pub fn new(
        script_id: i64,
        script_name: impl Into<String>,
        source: impl Into<String>,
        shared: Arc<CapabilityTable>,
    ) -> Self {
        Self {
            script_id,
            script_name: script_name.into(),
            source: source.into(),
            shared,
            local: CapabilityTable::new(),
            compiled: Mutex::new(None),
        }
    }

    fn generation(&self) -> u64 {
        self.shared.generation() + self.local.generation()
    }

    fn compile_error(&self, err: Error) -> ScriptError {
        ScriptError::Compile {
            script: self.script_name.clone(),
            message: err.to_string(),
        }
    }

    fn runtime_error(&self, err: Error) -> ScriptError {
        ScriptError::Runtime {
            script: self.script_name.clone(),
            message: err.to_string(),
        }
    }

    fn build(&self) -> ScriptResult<Environment<'static>> {
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME, self.source.clone())
            .map_err(|e| self.compile_error(e))?;

        // local entries shadow shared ones
        for table in [&*self.shared, &self.local] {
            for capability in table.functions() {
                let name = capability.name().to_string();
                env.add_function(name, move |args: Rest<Value>| -> Result<Value, Error> {
                    let args = args
                        .iter()
                        .map(serde_json::to_value)
                        .collect::<Result<Vec<JsonValue>, _>>()
                        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
                    capability
                        .call(&args)
                        .map(|v| Value::from_serialize(&v))
                        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
                });
            }
            for (name, value) in table.values() {
                env.add_global(name, Value::from_serialize(&value));
            }
        }
        Ok(env)
    }

    /// Cached environment, rebuilt whenever a capability table changed
    fn environment(&self) -> ScriptResult<Arc<Environment<'static>>> {
        let generation = self.generation();
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| ScriptError::Runtime {
                script: self.script_name.clone(),
                message: "engine lock poisoned".to_string(),
            })?;
        if let Some(c) = compiled.as_ref() {
            if c.generation == generation {
                return Ok(c.env.clone());
            }
        }
        trace!(script = %self.script_name, generation, "Building script environment");
        let env = Arc::new(self.build()?);
        *compiled = Some(Compiled {
            generation,
            env: env.clone(),
        });
        Ok(env)
    }
}

impl ScriptEngine for JinjaEngine {
    fn script_id(&self) -> i64 {
        self.script_id
    }

    fn compile(&self) -> ScriptResult<()> {
        self.environment().map(|_| ())
    }

    fn assert_function(&self, name: &str, args: &[JsonValue]) -> ScriptResult<String> {
        let env = self.environment()?;
        let template = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| self.compile_error(e))?;
        let state = template
            .eval_to_state(minijinja::context! {})
            .map_err(|e| self.runtime_error(e))?;
        if state.lookup(name).is_none() {
            return Err(ScriptError::FunctionNotFound(name.to_string()));
        }
        let args: Vec<Value> = args.iter().map(Value::from_serialize).collect();
        let output = state
            .call_macro(name, &args)
            .map_err(|e| self.runtime_error(e))?;
        Ok(output.trim().to_string())
    }

    fn has_function(&self, name: &str) -> bool {
        let Ok(env) = self.environment() else {
            return false;
        };
        let Ok(template) = env.get_template(TEMPLATE_NAME) else {
            return false;
        };
        template
            .eval_to_state(minijinja::context! {})
            .map(|state| state.lookup(name).is_some())
            .unwrap_or(false)
    }

    fn eval(&self) -> ScriptResult<String> {
        let env = self.environment()?;
        let template = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| self.compile_error(e))?;
        template
            .render(minijinja::context! {})
            .map(|s| s.trim().to_string())
            .map_err(|e| self.runtime_error(e))
    }

    fn push_function(&self, capability: Capability) -> ScriptResult<()> {
        self.local.register(capability)?;
        Ok(())
    }

    fn push_struct(&self, name: &str, value: JsonValue) -> ScriptResult<()> {
        self.local.set_value(name, value)?;
        Ok(())
    }
}

//! Script engine contract for the hub
//!
//! The core binds named host capabilities into a [`CapabilityTable`] and
//! calls script functions through [`ScriptEngine::assert_function`].

mod capability;
mod engine;
mod error;
mod service;

pub use capability::{failed, Arity, Capability, CapabilityTable};
pub use engine::{JinjaEngine, ScriptEngine};
pub use error::{CapabilityError, CapabilityResult, ScriptError, ScriptResult};
pub use service::{call_blocking, call_blocking_holding, ScriptService, SharedEngine};

//! Script and capability errors

use hub_core::HubError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("invalid capability name: {0:?}")]
    InvalidName(String),

    #[error("capability already registered: {0}")]
    Duplicate(String),

    #[error("unknown capability: {0}")]
    Unknown(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("{name}: bad argument {index}: {message}")]
    BadArgument {
        name: String,
        index: usize,
        message: String,
    },

    #[error("{name}: {message}")]
    Failed { name: String, message: String },
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("compile error in {script}: {message}")]
    Compile { script: String, message: String },

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("runtime error in {script}: {message}")]
    Runtime { script: String, message: String },

    #[error("unsupported script language: {0}")]
    UnsupportedLang(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

impl From<ScriptError> for HubError {
    fn from(err: ScriptError) -> Self {
        HubError::Internal(err.to_string())
    }
}

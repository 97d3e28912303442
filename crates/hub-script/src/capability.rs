//! Named host functions and values exposed to scripts

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CapabilityError, CapabilityResult};

/// Accepted argument counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
            Arity::Between(min, max) => n >= min && n <= max,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Between(a, b) => write!(f, "{a} to {b}"),
        }
    }
}

type CapabilityFn = Arc<dyn Fn(&[Value]) -> CapabilityResult<Value> + Send + Sync>;

/// A host callable with a fixed name and declared arity
#[derive(Clone)]
pub struct Capability {
    name: String,
    arity: Arity,
    func: CapabilityFn,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

fn arg<A: DeserializeOwned>(name: &str, args: &[Value], index: usize) -> CapabilityResult<A> {
    let raw = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| CapabilityError::BadArgument {
        name: name.to_string(),
        index,
        message: e.to_string(),
    })
}

fn ret<R: Serialize>(name: &str, value: R) -> CapabilityResult<Value> {
    serde_json::to_value(value).map_err(|e| CapabilityError::Failed {
        name: name.to_string(),
        message: e.to_string(),
    })
}

impl Capability {
    /// Untyped capability over raw argument values
    pub fn new<F>(name: impl Into<String>, arity: Arity, func: F) -> Self
    where
        F: Fn(&[Value]) -> CapabilityResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            func: Arc::new(func),
        }
    }

    pub fn typed0<R, F>(name: impl Into<String>, func: F) -> Self
    where
        R: Serialize,
        F: Fn() -> CapabilityResult<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::new(name, Arity::Exact(0), move |_| ret(&label, func()?))
    }

    pub fn typed1<A, R, F>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> CapabilityResult<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::new(name, Arity::Exact(1), move |args| {
            ret(&label, func(arg(&label, args, 0)?)?)
        })
    }

    pub fn typed2<A, B, R, F>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        R: Serialize,
        F: Fn(A, B) -> CapabilityResult<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::new(name, Arity::Exact(2), move |args| {
            ret(&label, func(arg(&label, args, 0)?, arg(&label, args, 1)?)?)
        })
    }

    pub fn typed3<A, B, C, R, F>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        C: DeserializeOwned,
        R: Serialize,
        F: Fn(A, B, C) -> CapabilityResult<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::new(name, Arity::Exact(3), move |args| {
            ret(
                &label,
                func(
                    arg(&label, args, 0)?,
                    arg(&label, args, 1)?,
                    arg(&label, args, 2)?,
                )?,
            )
        })
    }

    /// Like [`Capability::typed2`] with the second argument optional
    pub fn typed1_opt<A, B, R, F>(name: impl Into<String>, func: F) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned + Default,
        R: Serialize,
        F: Fn(A, B) -> CapabilityResult<R> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::new(name, Arity::Between(1, 2), move |args| {
            let second = if args.len() > 1 {
                arg(&label, args, 1)?
            } else {
                B::default()
            };
            ret(&label, func(arg(&label, args, 0)?, second)?)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    /// Invoke after checking the argument count
    pub fn call(&self, args: &[Value]) -> CapabilityResult<Value> {
        if !self.arity.accepts(args.len()) {
            return Err(CapabilityError::Arity {
                name: self.name.clone(),
                expected: self.arity.to_string(),
                got: args.len(),
            });
        }
        (self.func)(args)
    }
}

/// Build a capability failure from any displayable error
pub fn failed(name: &str, err: impl fmt::Display) -> CapabilityError {
    CapabilityError::Failed {
        name: name.to_string(),
        message: err.to_string(),
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registered functions and values; every change bumps the generation so
/// engines know to rebuild
#[derive(Default)]
pub struct CapabilityTable {
    functions: DashMap<String, Capability>,
    values: DashMap<String, Value>,
    generation: AtomicU64,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function; names are checked here, never at call time
    pub fn register(&self, capability: Capability) -> CapabilityResult<()> {
        if !is_valid_name(capability.name()) {
            return Err(CapabilityError::InvalidName(capability.name().to_string()));
        }
        if self.values.contains_key(capability.name()) {
            return Err(CapabilityError::Duplicate(capability.name().to_string()));
        }
        match self.functions.entry(capability.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CapabilityError::Duplicate(capability.name().to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(capability);
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.functions.remove(name).is_some();
        if removed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Expose a plain value, replacing any previous one of the same name
    pub fn set_value(&self, name: &str, value: Value) -> CapabilityResult<()> {
        if !is_valid_name(name) {
            return Err(CapabilityError::InvalidName(name.to_string()));
        }
        if self.functions.contains_key(name) {
            return Err(CapabilityError::Duplicate(name.to_string()));
        }
        self.values.insert(name.to_string(), value);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> CapabilityResult<Value> {
        let capability = self
            .functions
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
        capability.call(args)
    }

    pub fn functions(&self) -> Vec<Capability> {
        self.functions.iter().map(|c| c.value().clone()).collect()
    }

    pub fn values(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .map(|v| (v.key().clone(), v.value().clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

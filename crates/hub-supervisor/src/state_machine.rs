//! Plugin lifecycle states
//!
//! ```text
//! NotLoaded → Loading → Loaded → Unloading → NotLoaded
//!                    ↘ NotLoaded (load failed)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Unloading,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::NotLoaded => "not_loaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// Error when a plugin is moved to a state it cannot reach
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid plugin transition from {from} to {to}: {reason}")]
pub struct InvalidTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub reason: &'static str,
}

impl PluginState {
    pub fn try_transition(self, to: PluginState) -> Result<PluginState, InvalidTransition> {
        use PluginState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, Loading)
                | (Loading, Loaded)
                | (Loading, NotLoaded)
                | (Loaded, Unloading)
                | (Unloading, NotLoaded)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: PluginState) -> bool {
        self.try_transition(to).is_ok()
    }

    /// Counted by the manager's outstanding total
    pub fn is_loaded(self) -> bool {
        self == PluginState::Loaded
    }

    fn transition_error_reason(from: PluginState, to: PluginState) -> &'static str {
        use PluginState::*;

        match (from, to) {
            (Loaded, Loading) | (Loading, Loading) => "plugin is already loaded or loading",
            (NotLoaded, Unloading) | (Unloading, Unloading) => "plugin is not loaded",
            (NotLoaded, Loaded) => "cannot jump to Loaded, load must run first",
            (Loaded, NotLoaded) => "cannot jump to NotLoaded, unload must run first",
            (Unloading, Loaded) => "unload in progress",
            _ => "invalid plugin state transition",
        }
    }
}

//! Core types for the hub
//!
//! Entity identities, persisted records, bus events with their topics and
//! the error taxonomy every other crate reports through.

mod entity_id;
mod error;
pub mod events;
pub mod models;

pub use entity_id::{EntityId, EntityIdError};
pub use error::{FieldError, HubError, HubResult, ValidationErrors};
pub use events::{topics, Event, StateParams, StateSnapshot};

/// Records are fetched and hydrated in pages of this size by default
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default depth of an actor's inbound action queue
pub const DEFAULT_MAILBOX_DEPTH: usize = 1000;

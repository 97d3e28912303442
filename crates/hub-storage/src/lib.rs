//! Persistence adaptors for hub records
//!
//! One [`Repository`] per record kind with paginated listing and search.
//! [`MemoryRepository`] keeps records in memory and can mirror every
//! mutation into a `.storage/` snapshot file.

mod memory;
mod records;
mod storage;

use async_trait::async_trait;
use hub_core::models::{
    Action, Area, Condition, Entity, EntityStorage, PluginRecord, Script, Task, Trigger,
};
use hub_core::HubError;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryRepository;
pub use storage::{Storage, StorageFile};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("snapshot {key} has version {found}, this build reads up to {supported}")]
    UnsupportedVersion { key: String, found: u32, supported: u32 },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for HubError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => HubError::NotFound { kind, id },
            StorageError::AlreadyExists { kind, id } => HubError::AlreadyExists { kind, id },
            other => HubError::Internal(other.to_string()),
        }
    }
}

/// A record kind the repositories know how to key, order and filter
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Ord + Hash + Display + Send + Sync + 'static;

    /// Kind name used in errors and storage keys
    const KIND: &'static str;

    fn key(&self) -> Self::Key;

    fn name(&self) -> &str;

    /// Numeric id slot filled from a sequence on add when zero
    fn id_slot(&mut self) -> Option<&mut i64> {
        None
    }

    fn enabled(&self) -> Option<bool> {
        None
    }

    /// Secondary grouping, e.g. the plugin an entity belongs to
    fn group(&self) -> Option<&str> {
        None
    }

    fn search_text(&self) -> String {
        self.name().to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sort {
    #[default]
    Asc,
    Desc,
}

/// Paginated listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
    /// `id` (default) or `name`
    pub order_by: Option<String>,
    pub sort: Sort,
    pub enabled: Option<bool>,
    pub group: Option<String>,
}

impl ListQuery {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            order_by: None,
            sort: Sort::Asc,
            enabled: None,
            group: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, sort: Sort) -> Self {
        self.order_by = Some(field.into());
        self.sort = sort;
        self
    }

    pub fn only_enabled(mut self) -> Self {
        self.enabled = Some(true);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Same filter, following page
    pub fn next_page(&self) -> Self {
        let mut next = self.clone();
        next.offset += self.limit;
        next
    }
}

/// One page of a listing with the unpaged total
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    /// Whether pages after `query` may still hold items
    pub fn has_more(&self, query: &ListQuery) -> bool {
        !self.items.is_empty() && query.offset + self.items.len() < self.total
    }
}

#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    async fn add(&self, item: T) -> StorageResult<T>;

    async fn get_by_id(&self, key: &T::Key) -> StorageResult<T>;

    async fn update(&self, item: T) -> StorageResult<T>;

    async fn delete(&self, key: &T::Key) -> StorageResult<()>;

    async fn list(&self, query: &ListQuery) -> StorageResult<Page<T>>;

    async fn search(&self, query: &str, limit: usize, offset: usize) -> StorageResult<Page<T>>;

    /// Update, or add when absent
    async fn upsert(&self, item: T) -> StorageResult<T> {
        match self.update(item.clone()).await {
            Err(StorageError::NotFound { .. }) => self.add(item).await,
            other => other,
        }
    }
}

pub type SharedRepository<T> = Arc<dyn Repository<T>>;

/// Every repository the core talks to
#[derive(Clone)]
pub struct Repositories {
    pub entities: SharedRepository<Entity>,
    pub entity_storage: SharedRepository<EntityStorage>,
    pub plugins: SharedRepository<PluginRecord>,
    pub scripts: SharedRepository<Script>,
    pub triggers: SharedRepository<Trigger>,
    pub tasks: SharedRepository<Task>,
    pub conditions: SharedRepository<Condition>,
    pub actions: SharedRepository<Action>,
    pub areas: SharedRepository<Area>,
}

impl Repositories {
    /// Purely in-memory repositories
    pub fn in_memory() -> Self {
        Self {
            entities: Arc::new(MemoryRepository::<Entity>::new()),
            entity_storage: Arc::new(MemoryRepository::<EntityStorage>::new()),
            plugins: Arc::new(MemoryRepository::<PluginRecord>::new()),
            scripts: Arc::new(MemoryRepository::<Script>::new()),
            triggers: Arc::new(MemoryRepository::<Trigger>::new()),
            tasks: Arc::new(MemoryRepository::<Task>::new()),
            conditions: Arc::new(MemoryRepository::<Condition>::new()),
            actions: Arc::new(MemoryRepository::<Action>::new()),
            areas: Arc::new(MemoryRepository::<Area>::new()),
        }
    }

    /// Repositories backed by snapshot files in `storage`
    pub async fn open(storage: Storage) -> StorageResult<Self> {
        storage.ensure_dir().await?;
        Ok(Self {
            entities: Arc::new(MemoryRepository::<Entity>::open(storage.clone()).await?),
            entity_storage: Arc::new(MemoryRepository::<EntityStorage>::open(storage.clone()).await?),
            plugins: Arc::new(MemoryRepository::<PluginRecord>::open(storage.clone()).await?),
            scripts: Arc::new(MemoryRepository::<Script>::open(storage.clone()).await?),
            triggers: Arc::new(MemoryRepository::<Trigger>::open(storage.clone()).await?),
            tasks: Arc::new(MemoryRepository::<Task>::open(storage.clone()).await?),
            conditions: Arc::new(MemoryRepository::<Condition>::open(storage.clone()).await?),
            actions: Arc::new(MemoryRepository::<Action>::open(storage.clone()).await?),
            areas: Arc::new(MemoryRepository::<Area>::open(storage).await?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_maps_to_taxonomy() {
        let err: HubError = StorageError::NotFound {
            kind: "trigger",
            id: "4".into(),
        }
        .into();
        assert_eq!(err, HubError::not_found("trigger", 4));

        let err: HubError = StorageError::Io(std::io::Error::other("disk")).into();
        assert!(matches!(err, HubError::Internal(_)));
    }

    #[test]
    fn test_has_more() {
        let query = ListQuery::new(2, 0);
        let page = Page {
            items: vec![1, 2],
            total: 3,
        };
        assert!(page.has_more(&query));
        assert!(!page.has_more(&query.next_page().next_page()));
        let last = Page {
            items: vec![3],
            total: 3,
        };
        assert!(!last.has_more(&query.next_page()));
    }
}

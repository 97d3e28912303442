//! In-memory repository with optional snapshot persistence

use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{ListQuery, Page, Record, Repository, Sort, Storage, StorageError, StorageFile, StorageResult};

const STORAGE_VERSION: u32 = 1;
const STORAGE_MINOR_VERSION: u32 = 1;

pub struct MemoryRepository<T: Record> {
    items: DashMap<T::Key, T>,
    seq: AtomicI64,
    storage: Option<Storage>,
    /// Serializes snapshot writes
    save_lock: Mutex<()>,
}

impl<T: Record> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            seq: AtomicI64::new(0),
            storage: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Storage key of this kind's snapshot file
    pub fn storage_key() -> String {
        format!("hub.{}", T::KIND)
    }

    /// Load the snapshot from `storage` and keep writing to it
    pub async fn open(storage: Storage) -> StorageResult<Self> {
        let mut repo = Self::new();
        if let Some(file) = storage.load::<Vec<T>>(&Self::storage_key(), STORAGE_VERSION).await? {
            debug!(kind = T::KIND, count = file.data.len(), "Loaded records");
            for mut item in file.data {
                if let Some(id) = item.id_slot() {
                    repo.seq.fetch_max(*id, Ordering::SeqCst);
                }
                repo.items.insert(item.key(), item);
            }
        }
        repo.storage = Some(storage);
        Ok(repo)
    }

    async fn persist(&self) -> StorageResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let mut data: Vec<T> = self.items.iter().map(|e| e.value().clone()).collect();
        data.sort_by(|a, b| a.key().cmp(&b.key()));
        let file = StorageFile::new(Self::storage_key(), data, STORAGE_VERSION, STORAGE_MINOR_VERSION);
        storage.save(&file).await
    }

    fn not_found(key: &T::Key) -> StorageError {
        StorageError::NotFound {
            kind: T::KIND,
            id: key.to_string(),
        }
    }

    fn sorted(&self, mut items: Vec<T>, query: &ListQuery) -> Vec<T> {
        let by_name = query.order_by.as_deref() == Some("name");
        items.sort_by(|a, b| {
            let ord = if by_name {
                a.name().cmp(b.name()).then_with(|| a.key().cmp(&b.key()))
            } else {
                a.key().cmp(&b.key())
            };
            match query.sort {
                Sort::Asc => ord,
                Sort::Desc => ord.reverse(),
            }
        });
        items
    }

    fn page(items: Vec<T>, limit: usize, offset: usize) -> Page<T> {
        let total = items.len();
        let items = items.into_iter().skip(offset).take(limit).collect();
        Page { items, total }
    }
}

impl<T: Record> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn add(&self, mut item: T) -> StorageResult<T> {
        if let Some(id) = item.id_slot() {
            if *id == 0 {
                *id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            } else {
                self.seq.fetch_max(*id, Ordering::SeqCst);
            }
        }
        let key = item.key();
        match self.items.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StorageError::AlreadyExists {
                    kind: T::KIND,
                    id: key.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(item.clone());
            }
        }
        self.persist().await?;
        Ok(item)
    }

    async fn get_by_id(&self, key: &T::Key) -> StorageResult<T> {
        self.items
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| Self::not_found(key))
    }

    async fn update(&self, item: T) -> StorageResult<T> {
        let key = item.key();
        match self.items.get_mut(&key) {
            Some(mut slot) => *slot = item.clone(),
            None => return Err(Self::not_found(&key)),
        }
        self.persist().await?;
        Ok(item)
    }

    async fn delete(&self, key: &T::Key) -> StorageResult<()> {
        self.items.remove(key).ok_or_else(|| Self::not_found(key))?;
        self.persist().await
    }

    async fn list(&self, query: &ListQuery) -> StorageResult<Page<T>> {
        let items: Vec<T> = self
            .items
            .iter()
            .map(|e| e.value().clone())
            .filter(|item| query.enabled.map_or(true, |want| item.enabled() == Some(want)))
            .filter(|item| {
                query
                    .group
                    .as_deref()
                    .map_or(true, |group| item.group() == Some(group))
            })
            .collect();
        Ok(Self::page(self.sorted(items, query), query.limit, query.offset))
    }

    async fn search(&self, query: &str, limit: usize, offset: usize) -> StorageResult<Page<T>> {
        let needle = query.to_lowercase();
        let mut items: Vec<T> = self
            .items
            .iter()
            .filter(|e| e.value().search_text().contains(&needle))
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| match a.name().len().cmp(&b.name().len()) {
            CmpOrdering::Equal => a.key().cmp(&b.key()),
            other => other,
        });
        Ok(Self::page(items, limit, offset))
    }
}

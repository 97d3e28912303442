//! Expiring cache of last-state events
//!
//! A slot is created with a short placeholder lifetime the moment a
//! reconstruction starts; concurrent readers of the same entity wait on
//! that slot instead of rebuilding. Once filled, the slot lives for the
//! full TTL. Invalidation drops the slot; an in-flight reconstruction
//! still answers its own waiters but is never cached.

use dashmap::DashMap;
use hub_core::{EntityId, Event, HubResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

struct Slot {
    expires: Instant,
    cell: Arc<OnceCell<Event>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub builds: u64,
    pub invalidations: u64,
}

pub struct StateCache {
    slots: DashMap<EntityId, Slot>,
    ttl: Duration,
    placeholder_ttl: Duration,
    hits: AtomicU64,
    builds: AtomicU64,
    invalidations: AtomicU64,
}

impl StateCache {
    pub fn new(ttl: Duration, placeholder_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            placeholder_ttl,
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn slot(&self, id: &EntityId) -> Arc<OnceCell<Event>> {
        let now = Instant::now();
        let mut slot = self.slots.entry(id.clone()).or_insert_with(|| Slot {
            expires: now + self.placeholder_ttl,
            cell: Arc::new(OnceCell::new()),
        });
        if slot.expires <= now {
            *slot = Slot {
                expires: now + self.placeholder_ttl,
                cell: Arc::new(OnceCell::new()),
            };
        }
        slot.cell.clone()
    }

    /// Cached event for `id`, or the result of `build`
    pub async fn get_or_build<F, Fut>(&self, id: &EntityId, build: F) -> HubResult<Event>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<Event>>,
    {
        let cell = self.slot(id);
        if let Some(event) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(event.clone());
        }

        let result = cell
            .get_or_try_init(|| async {
                self.builds.fetch_add(1, Ordering::Relaxed);
                build().await
            })
            .await
            .cloned();

        match &result {
            Ok(_) => {
                // extend only if the slot is still the one we filled
                if let Some(mut slot) = self.slots.get_mut(id) {
                    if Arc::ptr_eq(&slot.cell, &cell) {
                        slot.expires = Instant::now() + self.ttl;
                    }
                }
            }
            Err(_) => {
                self.slots.remove_if(id, |_, slot| Arc::ptr_eq(&slot.cell, &cell));
            }
        }
        result
    }

    pub fn invalidate(&self, id: &EntityId) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.slots.remove(id);
    }

    /// Drop every entry of one plugin
    pub fn invalidate_plugin(&self, plugin: &str) {
        self.slots.retain(|id, _| id.plugin_name() != plugin);
    }

    /// Whether a live, filled entry exists
    pub fn contains(&self, id: &EntityId) -> bool {
        self.slots
            .get(id)
            .map_or(false, |slot| slot.expires > Instant::now() && slot.cell.initialized())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::{HubError, StateSnapshot};

    fn id() -> EntityId {
        "sensor.kitchen".parse().unwrap()
    }

    fn event() -> Event {
        Event::LastStateChanged {
            plugin_name: "sensor".into(),
            entity_id: id(),
            old_state: StateSnapshot::default(),
            new_state: StateSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let cache = StateCache::new(Duration::from_secs(30), Duration::from_secs(10));
        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        cache
            .get_or_build(&id(), || async { Err(HubError::internal("rebuilt")) })
            .await
            .unwrap();

        assert_eq!(cache.stats().builds, 1);
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.contains(&id()));
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let cache = StateCache::new(Duration::from_secs(30), Duration::from_secs(10));
        let err = cache
            .get_or_build(&id(), || async { Err(HubError::PluginNotLoaded("sensor".into())) })
            .await;
        assert!(err.is_err());
        assert!(!cache.contains(&id()));

        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        assert_eq!(cache.stats().builds, 2);
    }

    #[tokio::test]
    async fn test_expired_entry_rebuilds() {
        let cache = StateCache::new(Duration::ZERO, Duration::from_secs(10));
        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        assert_eq!(cache.stats().builds, 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = StateCache::new(Duration::from_secs(30), Duration::from_secs(10));
        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        cache.invalidate(&id());
        assert!(!cache.contains(&id()));

        cache.get_or_build(&id(), || async { Ok(event()) }).await.unwrap();
        cache.invalidate_plugin("sensor");
        assert!(!cache.contains(&id()));
        assert_eq!(cache.stats().invalidations, 1);
    }
}

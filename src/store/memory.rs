//! In-process bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BucketStore, StoreError};
use crate::ratelimit::{Clock, SystemClock};

/// A stored value and the epoch millisecond at which it expires.
#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at_ms: i64,
}

impl Slot {
    fn new(value: &str, ttl: Duration, now_ms: i64) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            value: value.to_string(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Bucket store backed by a sharded concurrent map.
///
/// Each compare-and-swap runs under the shard lock for its key, so updates to
/// one key are linearizable across all threads of the process. Expired
/// entries are invisible immediately and physically removed by
/// [`sweep`](MemoryStore::sweep), either on demand or from the background
/// task started by [`spawn_sweeper`](MemoryStore::spawn_sweeper).
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweep expired entries every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired buckets");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        match self.entries.get_mut(key) {
            Some(mut slot) if slot.is_live(now) && slot.value == expected => {
                *slot = Slot::new(new, ttl, now);
                Ok(true)
            }
            _ => {
                trace!(key = %key, "Compare-and-swap lost");
                Ok(false)
            }
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(Slot::new(value, ttl, now));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl, now));
                Ok(true)
            }
        }
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// Last-known number of retained messages in one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountCacheEntry {
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Process-wide map from channel id to its last-known message count.
///
/// Misses are filled by a caller-supplied counting function. Concurrent misses
/// on the same channel wait on a per-channel lock, so the counting function
/// runs once; other channels are never blocked by a slow scan.
#[derive(Default)]
pub struct ChannelCountCache {
    entries: Mutex<HashMap<String, CountCacheEntry>>,
    fill_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelCountCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, channel_id: &str) -> Option<CountCacheEntry> {
        self.lock_entries().get(channel_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Cached count for `channel_id`, or the result of `count` stored as the
    /// new entry. A failed count leaves the cache without an entry.
    pub async fn get_count<F, Fut, E>(&self, channel_id: &str, count: F) -> Result<u64, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, E>>,
    {
        if let Some(entry) = self.entry(channel_id) {
            return Ok(entry.count);
        }

        let fill_lock = self.fill_lock(channel_id);
        let filled = {
            let _filling = fill_lock.lock().await;
            match self.entry(channel_id) {
                Some(entry) => Ok(entry.count),
                None => {
                    tracing::debug!(channel_id, "count cache miss; scanning history");
                    count().await.inspect(|counted| self.set_count(channel_id, *counted))
                }
            }
        };
        drop(fill_lock);
        self.prune_fill_lock(channel_id);
        filled
    }

    /// Bump the count for a new arrival. Returns whether an entry existed;
    /// never creates one.
    pub fn increment_count(&self, channel_id: &str) -> bool {
        let mut entries = self.lock_entries();
        match entries.get_mut(channel_id) {
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                entry.last_updated = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn set_count(&self, channel_id: &str, count: u64) {
        self.lock_entries().insert(
            channel_id.to_string(),
            CountCacheEntry {
                count,
                last_updated: Utc::now(),
            },
        );
    }

    pub fn invalidate(&self, channel_id: &str) {
        self.lock_entries().remove(channel_id);
        self.prune_fill_lock(channel_id);
    }

    /// Drop every entry. Used after a gateway reconnect, when arrivals may
    /// have been missed.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    fn fill_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.lock_fill_locks()
                .entry(channel_id.to_string())
                .or_default(),
        )
    }

    /// Channels with a fill lock allocated.
    pub fn pending_fills(&self) -> usize {
        self.lock_fill_locks().len()
    }

    fn prune_fill_lock(&self, channel_id: &str) {
        let mut locks = self.lock_fill_locks();
        if locks
            .get(channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(channel_id);
        }
    }

    fn lock_fill_locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.fill_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CountCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

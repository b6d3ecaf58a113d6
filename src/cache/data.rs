use super::{BackoffState, CacheEntry, CacheKey};
use crate::backoff::SharedBackoff;
use crate::balancer::ChildPolicyRegistry;
use crate::error::RlsError;
use crate::metrics::MetricsSink;
use lru::LruCache;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of [`DataCache::add_entry`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddEntryOutcome {
    /// An entry evicted to make room had a live backoff timer
    pub evicted_backoff_timer: bool,
    /// The entry was stored
    pub accepted: bool,
}

/// Size bounded cache of routing decisions with LRU eviction.
///
/// Deleting an entry releases its child policy references.
pub struct DataCache {
    entries: LruCache<CacheKey, CacheEntry>,
    max_size: u64,
    current_size: u64,
    registry: Arc<ChildPolicyRegistry>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: bool,
}

impl DataCache {
    /// Create a new data cache holding at most `max_size` bytes
    pub fn new(
        max_size: u64,
        registry: Arc<ChildPolicyRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_size,
            current_size: 0,
            registry,
            metrics,
            shutdown: false,
        }
    }

    /// Entry for `key`, promoted to most recently used
    pub fn get_entry(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        if self.shutdown {
            return None;
        }
        self.entries.get(key)
    }

    /// Entry for `key` without touching its recency
    pub fn peek_entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    pub(crate) fn get_entry_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        if self.shutdown {
            return None;
        }
        self.entries.peek_mut(key)
    }

    /// Store a new entry, evicting least recently used entries if the cache
    /// grows past its capacity.
    pub fn add_entry(&mut self, key: CacheKey, mut entry: CacheEntry) -> AddEntryOutcome {
        if self.shutdown {
            self.release_entry(&mut entry);
            return AddEntryOutcome::default();
        }

        if entry.size > self.max_size {
            let err = RlsError::entry_too_large(entry.size, self.max_size);
            warn!(key = %key, error = %err, "Dropping cache entry");
            self.release_entry(&mut entry);
            return AddEntryOutcome::default();
        }

        let mut evicted_backoff_timer = false;
        if self.entries.contains(&key) {
            evicted_backoff_timer |= self.delete_entry(&key);
        }

        self.current_size += entry.size;
        self.entries.put(key, entry);

        evicted_backoff_timer |= self.evict_to(self.max_size);
        self.record_metrics();

        AddEntryOutcome {
            evicted_backoff_timer,
            accepted: true,
        }
    }

    /// Change the capacity. Shrinking evicts least recently used entries.
    ///
    /// Returns whether a live backoff timer was cancelled.
    pub fn resize(&mut self, new_size: u64) -> bool {
        if self.shutdown {
            return false;
        }

        info!(from = self.max_size, to = new_size, "Resizing data cache");
        self.max_size = new_size;
        let cancelled = self.evict_to(new_size);
        self.record_metrics();
        cancelled
    }

    /// Delete entries whose expiry and backoff expiry are both in the past.
    ///
    /// Returns whether anything was deleted.
    pub fn evict_expired_entries(&mut self) -> bool {
        if self.shutdown {
            return false;
        }

        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_purgeable(now))
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return false;
        }

        for key in &expired {
            self.delete_entry(key);
        }

        debug!(
            "Cleaned up {} expired cache entries ({} bytes in use)",
            expired.len(),
            self.current_size
        );
        self.record_metrics();
        true
    }

    /// Cancel every backoff timer and forget all retry history.
    ///
    /// Returns whether any entry had backoff state to reset.
    pub fn reset_backoff_state(&mut self, strategy: SharedBackoff) -> bool {
        if self.shutdown {
            return false;
        }

        let mut reset = false;
        for (_, entry) in self.entries.iter_mut() {
            if !entry.has_backoff() {
                continue;
            }

            if let Some(state) = entry.backoff_state.as_mut() {
                state.cancel_timer();
            }
            entry.backoff_state = Some(BackoffState::new(Arc::clone(&strategy)));
            entry.backoff_time = None;
            entry.backoff_expiry_time = None;
            reset = true;
        }

        reset
    }

    /// Adjust size accounting after an entry's payload changed.
    ///
    /// An entry that grew past the capacity is deleted.
    pub fn update_entry_size(&mut self, key: &CacheKey, new_size: u64) -> bool {
        if self.shutdown {
            return false;
        }

        let Some(entry) = self.entries.peek_mut(key) else {
            return false;
        };

        if new_size > self.max_size {
            let err = RlsError::entry_too_large(new_size, self.max_size);
            warn!(key = %key, error = %err, "Dropping cache entry");
            let cancelled = self.delete_entry(key);
            self.record_metrics();
            return cancelled;
        }

        self.current_size = self.current_size - entry.size + new_size;
        entry.size = new_size;

        let cancelled = self.evict_to(self.max_size);
        self.record_metrics();
        cancelled
    }

    /// Delete every entry; later operations are no-ops
    pub fn stop(&mut self) {
        if self.shutdown {
            return;
        }

        while let Some((_, mut entry)) = self.entries.pop_lru() {
            self.current_size -= entry.size;
            self.release_entry(&mut entry);
        }
        self.shutdown = true;
        self.record_metrics();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently accounted
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Capacity in bytes
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<CacheKey> {
        self.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// Evict from the LRU end until at most `target` bytes are in use.
    ///
    /// Stops early at an entry that may not be evicted yet.
    fn evict_to(&mut self, target: u64) -> bool {
        let now = Instant::now();
        let mut cancelled = false;

        while self.current_size > target {
            let Some((key, entry)) = self.entries.peek_lru() else {
                break;
            };

            if !entry.can_evict(now) {
                debug!(
                    key = %key,
                    size = self.current_size,
                    capacity = target,
                    "Least recently used entry is not evictable yet, cache stays over capacity"
                );
                break;
            }

            let key = key.clone();
            cancelled |= self.delete_entry(&key);
        }

        cancelled
    }

    fn delete_entry(&mut self, key: &CacheKey) -> bool {
        let Some(mut entry) = self.entries.pop(key) else {
            return false;
        };

        self.current_size -= entry.size;
        debug!(key = %key, size = entry.size, "Deleted cache entry");
        self.release_entry(&mut entry)
    }

    /// Cancel the entry's timer and drop its child references
    fn release_entry(&self, entry: &mut CacheEntry) -> bool {
        let cancelled = entry
            .backoff_state
            .as_mut()
            .map(BackoffState::cancel_timer)
            .unwrap_or(false);

        let targets = entry.targets();
        entry.child_policy_wrappers.clear();
        if !targets.is_empty() {
            self.registry.release_references(&targets);
        }

        cancelled
    }

    fn record_metrics(&self) {
        self.metrics.record_cache_entries(self.entries.len() as u64);
        self.metrics.record_cache_size(self.current_size);
    }
}

impl fmt::Debug for DataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCache")
            .field("entries", &self.entries.len())
            .field("current_size", &self.current_size)
            .field("max_size", &self.max_size)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

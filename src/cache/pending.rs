use super::{BackoffState, CacheKey};
use std::collections::HashMap;

/// Keys with a lookup in flight.
///
/// Each pending key carries the backoff state that is promoted into the
/// cache entry if the lookup fails.
#[derive(Debug, Default)]
pub struct PendingRequestTracker {
    pending: HashMap<CacheKey, BackoffState>,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Register a lookup. Returns false if one is already in flight.
    pub fn insert(&mut self, key: CacheKey, backoff_state: BackoffState) -> bool {
        if self.pending.contains_key(&key) {
            return false;
        }
        self.pending.insert(key, backoff_state);
        true
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<BackoffState> {
        self.pending.remove(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

//! # Route cache
//!
//! Resolved routing decisions keyed by request fingerprint, plus the set of
//! fingerprints with a lookup in flight.
//!
//! Both live behind one lock ([`RouteCache`]) so that checking for a cached
//! entry, checking for a pending lookup and registering a new lookup happen
//! atomically.

pub mod data; // size bounded LRU data cache
pub mod pending; // in-flight lookup deduplication

use crate::backoff::SharedBackoff;
use crate::balancer::ChildPolicyWrapper;
use crate::error::RlsError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use data::{AddEntryOutcome, DataCache};
pub use pending::PendingRequestTracker;

/// Request fingerprint: the path plus the canonical key encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub keys: String,
}

impl CacheKey {
    pub fn new<P: Into<String>, K: Into<String>>(path: P, keys: K) -> Self {
        Self {
            path: path.into(),
            keys: keys.into(),
        }
    }

    /// Bytes accounted for an entry under this key
    pub fn entry_size(&self, header_data: &str) -> u64 {
        (self.path.len() + self.keys.len() + header_data.len()) as u64
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.path, self.keys)
    }
}

/// One-shot task fired when a backoff period ends
#[derive(Debug)]
pub struct BackoffTimer {
    handle: JoinHandle<()>,
}

impl BackoffTimer {
    /// Run `on_fire` after `delay` on the current runtime
    pub fn spawn<F>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_future(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        })
    }

    fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Whether the timer has not fired yet
    pub fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the timer. Returns whether it was still pending.
    pub fn cancel(self) -> bool {
        let live = self.is_live();
        self.handle.abort();
        live
    }
}

/// Retry bookkeeping for a key whose lookups keep failing
#[derive(Debug)]
pub struct BackoffState {
    pub retries: u32,
    pub strategy: SharedBackoff,
    pub timer: Option<BackoffTimer>,
}

impl BackoffState {
    pub fn new(strategy: SharedBackoff) -> Self {
        Self {
            retries: 0,
            strategy,
            timer: None,
        }
    }

    /// Copy carried by a pending lookup; the timer stays with the entry
    pub fn carry_over(&self) -> Self {
        Self {
            retries: self.retries,
            strategy: Arc::clone(&self.strategy),
            timer: None,
        }
    }

    /// Cancel the timer if any. Returns whether a live timer was stopped.
    pub fn cancel_timer(&mut self) -> bool {
        self.timer.take().map(BackoffTimer::cancel).unwrap_or(false)
    }

    fn is_pristine(&self) -> bool {
        self.retries == 0 && self.timer.is_none()
    }
}

/// A resolved routing decision
#[derive(Debug, Default)]
pub struct CacheEntry {
    /// Child policies of the returned targets, in server order
    pub child_policy_wrappers: Vec<Arc<ChildPolicyWrapper>>,
    /// Opaque data forwarded to the chosen backend
    pub header_data: String,
    pub expiry_time: Option<Instant>,
    pub stale_time: Option<Instant>,
    /// Eviction by size is refused before this instant
    pub earliest_evict_time: Option<Instant>,
    /// Outcome of the most recent lookup
    pub status: Option<RlsError>,
    pub backoff_state: Option<BackoffState>,
    pub backoff_time: Option<Instant>,
    pub backoff_expiry_time: Option<Instant>,
    pub size: u64,
}

impl CacheEntry {
    /// Targets of the entry in server order
    pub fn targets(&self) -> Vec<String> {
        self.child_policy_wrappers
            .iter()
            .map(|w| w.target().to_string())
            .collect()
    }

    /// No valid routing data: never resolved or past max age
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry_time.map_or(true, |t| now > t)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.stale_time.is_some_and(|t| now > t)
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_time.is_some_and(|t| now < t)
    }

    /// Whether size based eviction may remove the entry
    pub fn can_evict(&self, now: Instant) -> bool {
        self.earliest_evict_time.map_or(true, |t| now >= t)
    }

    /// Whether the periodic sweep may remove the entry
    pub fn is_purgeable(&self, now: Instant) -> bool {
        self.is_expired(now) && self.backoff_expiry_time.map_or(true, |t| now > t)
    }

    /// Whether the backoff bookkeeping differs from a fresh entry
    pub fn has_backoff(&self) -> bool {
        self.backoff_time.is_some()
            || self.backoff_expiry_time.is_some()
            || self.backoff_state.as_ref().is_some_and(|s| !s.is_pristine())
    }
}

/// Data cache and pending lookups, guarded together
#[derive(Debug)]
pub struct RouteCache {
    pub data: DataCache,
    pub pending: PendingRequestTracker,
}

impl RouteCache {
    pub fn new(data: DataCache) -> Self {
        Self {
            data,
            pending: PendingRequestTracker::new(),
        }
    }
}

use super::rls::BalancerShared;
use super::{ChildPolicyWrapper, ConnectivityState, PickInfo, PickResult};
use crate::backoff::SharedBackoff;
use crate::cache::{BackoffState, CacheKey, RouteCache};
use crate::control_channel::{ControlChannel, LookupReason};
use crate::error::{PickError, PickResultLabel, RlsError};
use crate::keys::{KeyBuilderMap, RequestKeys};
use crate::metrics::MetricsSink;
use hyper::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Metadata key carrying the header data returned by the lookup server
pub const RLS_DATA_HEADER: &str = "x-google-rls-data";

/// Snapshot of the balancer used to route RPCs.
///
/// Configuration dependent parts are fixed at creation; the route cache is
/// shared with the balancer and read under its lock on every pick.
pub struct RlsPicker {
    pub(crate) key_builders: Arc<KeyBuilderMap>,
    pub(crate) channel_target: String,
    pub(crate) default_policy: Option<Arc<ChildPolicyWrapper>>,
    pub(crate) control_channel: Option<Arc<ControlChannel>>,
    pub(crate) backoff_strategy: SharedBackoff,
    pub(crate) cache: Arc<Mutex<RouteCache>>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) balancer: Weak<BalancerShared>,
}

/// What to do with an RPC, decided under the cache lock
enum Decision {
    Delegate {
        wrappers: Vec<Arc<ChildPolicyWrapper>>,
        header_data: String,
    },
    Queue,
    DefaultOrFail(RlsError),
}

impl RlsPicker {
    /// Route one RPC
    pub fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError> {
        let keys = self
            .key_builders
            .build_keys(&info.metadata, &self.channel_target, &info.full_method);
        let cache_key = CacheKey::new(info.full_method.clone(), keys.encoded.clone());

        match self.decide(&cache_key, &keys) {
            Decision::Delegate {
                wrappers,
                header_data,
            } => self.delegate(&wrappers, &header_data, info),
            Decision::Queue => Err(PickError::Queue),
            Decision::DefaultOrFail(err) => self.use_default_or_fail(err, info),
        }
    }

    fn decide(&self, cache_key: &CacheKey, keys: &RequestKeys) -> Decision {
        let now = Instant::now();
        let mut guard = self.cache.lock();
        let RouteCache { data, pending } = &mut *guard;
        let has_pending = pending.contains(cache_key);

        let Some(entry) = data.get_entry(cache_key) else {
            if has_pending {
                return Decision::Queue;
            }
            let backoff = BackoffState::new(Arc::clone(&self.backoff_strategy));
            return self.lookup_or_fallback(pending, cache_key, keys, backoff);
        };

        if has_pending {
            return if entry.is_expired(now) {
                Decision::Queue
            } else {
                Decision::Delegate {
                    wrappers: entry.child_policy_wrappers.clone(),
                    header_data: entry.header_data.clone(),
                }
            };
        }

        if !entry.is_expired(now) {
            let decision = Decision::Delegate {
                wrappers: entry.child_policy_wrappers.clone(),
                header_data: entry.header_data.clone(),
            };

            if entry.is_stale(now) && !entry.in_backoff(now) {
                let backoff = self.carried_backoff(entry.backoff_state.as_ref());
                let stale_header_data = entry.header_data.clone();
                debug!(key = %cache_key, "Entry is stale, refreshing in the background");
                self.send_lookup(
                    pending,
                    cache_key,
                    keys,
                    LookupReason::Stale,
                    stale_header_data,
                    backoff,
                );
            }
            return decision;
        }

        if entry.in_backoff(now) {
            let message = entry
                .status
                .as_ref()
                .map(RlsError::message)
                .unwrap_or_else(|| "lookup in backoff".to_string());
            return Decision::DefaultOrFail(RlsError::unavailable(format!(
                "most recent error from route lookup server: {}",
                message
            )));
        }

        let backoff = self.carried_backoff(entry.backoff_state.as_ref());
        self.lookup_or_fallback(pending, cache_key, keys, backoff)
    }

    fn carried_backoff(&self, state: Option<&BackoffState>) -> BackoffState {
        state
            .map(BackoffState::carry_over)
            .unwrap_or_else(|| BackoffState::new(Arc::clone(&self.backoff_strategy)))
    }

    fn lookup_or_fallback(
        &self,
        pending: &mut crate::cache::PendingRequestTracker,
        cache_key: &CacheKey,
        keys: &RequestKeys,
        backoff: BackoffState,
    ) -> Decision {
        let throttled = self.send_lookup(
            pending,
            cache_key,
            keys,
            LookupReason::Miss,
            String::new(),
            backoff,
        );

        if throttled {
            Decision::DefaultOrFail(RlsError::Throttled)
        } else {
            Decision::Queue
        }
    }

    /// Register a pending lookup and hand it to the control channel.
    ///
    /// Returns whether the lookup was throttled.
    fn send_lookup(
        &self,
        pending: &mut crate::cache::PendingRequestTracker,
        cache_key: &CacheKey,
        keys: &RequestKeys,
        reason: LookupReason,
        stale_header_data: String,
        backoff: BackoffState,
    ) -> bool {
        let Some(control_channel) = &self.control_channel else {
            return false;
        };

        if !pending.insert(cache_key.clone(), backoff) {
            return false;
        }

        let balancer = self.balancer.clone();
        let response_key = cache_key.clone();
        let throttled = control_channel.lookup(
            keys.map.clone(),
            reason,
            stale_header_data,
            Box::new(move |result| {
                if let Some(balancer) = balancer.upgrade() {
                    balancer.handle_lookup_response(response_key, result);
                }
            }),
        );

        if throttled {
            pending.remove(cache_key);
        }
        throttled
    }

    /// First child not in TRANSIENT_FAILURE, else the last one
    fn delegate(
        &self,
        wrappers: &[Arc<ChildPolicyWrapper>],
        header_data: &str,
        info: &PickInfo,
    ) -> Result<PickResult, PickError> {
        let Some(last) = wrappers.last() else {
            return Err(PickError::Queue);
        };

        let wrapper = wrappers
            .iter()
            .find(|w| w.connectivity() != ConnectivityState::TransientFailure)
            .unwrap_or(last);

        let state = wrapper.state();
        let result = state.picker.pick(info).map(|mut result| {
            match HeaderValue::from_str(header_data) {
                Ok(value) => {
                    result
                        .metadata
                        .append(HeaderName::from_static(RLS_DATA_HEADER), value);
                }
                Err(e) => {
                    warn!(target = %wrapper.target(), error = %e, "Header data is not a valid header value");
                }
            }
            result
        });

        if let Some(label) = result_label(&result) {
            self.metrics.record_target_pick(wrapper.target(), label);
        }
        result
    }

    fn use_default_or_fail(&self, err: RlsError, info: &PickInfo) -> Result<PickResult, PickError> {
        let Some(default_policy) = &self.default_policy else {
            debug!(error = %err, "No default target, failing pick");
            self.metrics.record_failed_pick();
            return Err(PickError::Failed(err));
        };

        let state = default_policy.state();
        let result = state.picker.pick(info);
        if let Some(label) = result_label(&result) {
            self.metrics
                .record_default_target_pick(default_policy.target(), label);
        }
        result
    }

    pub fn channel_target(&self) -> &str {
        &self.channel_target
    }

    pub fn default_target(&self) -> Option<&str> {
        self.default_policy.as_ref().map(|p| p.target())
    }
}

/// Queued picks are not recorded
fn result_label(result: &Result<PickResult, PickError>) -> Option<PickResultLabel> {
    match result {
        Ok(_) => Some(PickResultLabel::Complete),
        Err(PickError::Queue) => None,
        Err(e) => Some(e.result_label()),
    }
}

impl fmt::Debug for RlsPicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RlsPicker")
            .field("channel_target", &self.channel_target)
            .field("default_target", &self.default_target())
            .field("control_channel", &self.control_channel)
            .finish()
    }
}

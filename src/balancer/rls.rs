use super::{
    ChildPicker, ChildPolicyGroup, ChildPolicyRegistry, ChildPolicyWrapper, ClientConnection,
    ConnectivityState, RlsPicker,
};
use crate::backoff::{ExponentialBackoff, SharedBackoff};
use crate::cache::{BackoffState, BackoffTimer, CacheEntry, CacheKey, DataCache, RouteCache};
use crate::config::RouteLookupConfig;
use crate::control_channel::channel::BackToReadyCallback;
use crate::control_channel::{ControlChannel, RouteLookupConnector, RouteLookupResponse};
use crate::error::{RlsError, RlsResult};
use crate::keys::KeyBuilderMap;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::throttle::{AdaptiveThrottler, ThrottlerFactory};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default period of the expired entry sweep
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum time an entry stays in the cache after a successful lookup
pub const MIN_EVICT_DURATION: Duration = Duration::from_secs(5);

/// Data cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub pending_lookups: usize,
}

/// Route lookup balancer.
///
/// Cheap to clone; all clones drive the same balancer.
#[derive(Clone)]
pub struct RlsBalancer {
    shared: Arc<BalancerShared>,
}

/// Builder for [`RlsBalancer`]
pub struct RlsBalancerBuilder {
    channel_target: String,
    client_conn: Arc<dyn ClientConnection>,
    group: Arc<dyn ChildPolicyGroup>,
    connector: Arc<dyn RouteLookupConnector>,
    metrics: Arc<dyn MetricsSink>,
    purge_interval: Duration,
    backoff_strategy: SharedBackoff,
    throttler_factory: ThrottlerFactory,
}

impl RlsBalancerBuilder {
    /// Metrics sink, [`NoopMetrics`] by default
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Period of the expired entry sweep
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Backoff applied to keys whose lookups fail
    pub fn with_backoff_strategy(mut self, strategy: SharedBackoff) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Throttler used by every control channel
    pub fn with_throttler_factory(mut self, factory: ThrottlerFactory) -> Self {
        self.throttler_factory = factory;
        self
    }

    /// Create the balancer and start its background sweep.
    ///
    /// Must be called from within a Tokio runtime. No picker is published
    /// before the first successful [`RlsBalancer::update_config`].
    pub fn build(self) -> RlsBalancer {
        let registry = Arc::new(ChildPolicyRegistry::new(self.group));
        let data = DataCache::new(0, Arc::clone(&registry), Arc::clone(&self.metrics));

        let shared = Arc::new(BalancerShared {
            channel_target: self.channel_target,
            client_conn: self.client_conn,
            connector: self.connector,
            registry,
            cache: Arc::new(Mutex::new(RouteCache::new(data))),
            state: Mutex::new(OrchestrationState {
                config: None,
                key_builders: Arc::new(KeyBuilderMap::default()),
                control_channel: None,
                default_policy: None,
                inhibit_picker_updates: false,
                closed: false,
                connectivity: ConnectivityState::Idle,
            }),
            update_lock: tokio::sync::Mutex::new(()),
            metrics: self.metrics,
            backoff_strategy: self.backoff_strategy,
            throttler_factory: self.throttler_factory,
            purge_task: Mutex::new(None),
        });

        let task = spawn_purge_task(Arc::downgrade(&shared), self.purge_interval);
        *shared.purge_task.lock() = Some(task);

        info!(channel_target = %shared.channel_target, "Route lookup balancer created");
        RlsBalancer { shared }
    }
}

impl RlsBalancer {
    pub fn builder<S: Into<String>>(
        channel_target: S,
        client_conn: Arc<dyn ClientConnection>,
        group: Arc<dyn ChildPolicyGroup>,
        connector: Arc<dyn RouteLookupConnector>,
    ) -> RlsBalancerBuilder {
        RlsBalancerBuilder {
            channel_target: channel_target.into(),
            client_conn,
            group,
            connector,
            metrics: Arc::new(NoopMetrics),
            purge_interval: DEFAULT_PURGE_INTERVAL,
            backoff_strategy: ExponentialBackoff::shared_default(),
            throttler_factory: AdaptiveThrottler::default_factory(),
        }
    }

    /// Apply a new configuration.
    ///
    /// Updates are serialized. An update identical to the current
    /// configuration changes nothing. Exactly one picker is published per
    /// applied update.
    pub async fn update_config(&self, config: RouteLookupConfig) -> RlsResult<()> {
        self.shared.update_config(config).await
    }

    /// Record a state reported by the child policy of `target`
    pub fn update_child_state(
        &self,
        target: &str,
        connectivity: ConnectivityState,
        picker: Arc<dyn ChildPicker>,
    ) {
        self.shared.update_child_state(target, connectivity, picker);
    }

    /// Stop background work and release every child policy. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// State reported with the most recent picker
    pub fn connectivity_state(&self) -> ConnectivityState {
        self.shared.state.lock().connectivity
    }

    /// Currently applied configuration, with limits applied
    pub fn config(&self) -> Option<RouteLookupConfig> {
        self.shared.state.lock().config.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.shared.cache.lock();
        CacheStats {
            entries: cache.data.len(),
            size_bytes: cache.data.current_size(),
            capacity_bytes: cache.data.max_size(),
            pending_lookups: cache.pending.len(),
        }
    }

    /// Child policy wrapper of `target`, if any entry references it
    pub fn child_policy(&self, target: &str) -> Option<Arc<ChildPolicyWrapper>> {
        self.shared.registry.get(target)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl fmt::Debug for RlsBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RlsBalancer")
            .field("channel_target", &self.shared.channel_target)
            .field("connectivity", &self.connectivity_state())
            .field("cache", &self.cache_stats())
            .finish()
    }
}

struct OrchestrationState {
    config: Option<RouteLookupConfig>,
    key_builders: Arc<KeyBuilderMap>,
    control_channel: Option<Arc<ControlChannel>>,
    default_policy: Option<Arc<ChildPolicyWrapper>>,
    inhibit_picker_updates: bool,
    closed: bool,
    connectivity: ConnectivityState,
}

struct BackgroundTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the balancer handle, its pickers and its
/// background tasks.
///
/// Lock order: the cache lock may be taken while nothing else is held, the
/// orchestration lock (`state`) is never taken while the cache lock is held.
pub(crate) struct BalancerShared {
    channel_target: String,
    client_conn: Arc<dyn ClientConnection>,
    connector: Arc<dyn RouteLookupConnector>,
    registry: Arc<ChildPolicyRegistry>,
    cache: Arc<Mutex<RouteCache>>,
    state: Mutex<OrchestrationState>,
    update_lock: tokio::sync::Mutex<()>,
    metrics: Arc<dyn MetricsSink>,
    backoff_strategy: SharedBackoff,
    throttler_factory: ThrottlerFactory,
    purge_task: Mutex<Option<BackgroundTask>>,
}

impl BalancerShared {
    async fn update_config(self: &Arc<Self>, config: RouteLookupConfig) -> RlsResult<()> {
        let _serialized = self.update_lock.lock().await;

        config.validate().map_err(RlsError::from)?;
        let new_config = config.normalized();
        let key_builders = Arc::new(KeyBuilderMap::new(&new_config.key_builders)?);

        let old_config = {
            let state = self.state.lock();
            if state.closed {
                return Err(RlsError::Shutdown);
            }
            if state.config.as_ref() == Some(&new_config) {
                debug!("Configuration unchanged, ignoring update");
                return Ok(());
            }
            state.config.clone()
        };

        let new_channel = match &old_config {
            Some(old) if !old.control_channel_changed(&new_config) => None,
            _ => Some(Arc::new(self.build_control_channel(&new_config).await?)),
        };

        let mut old_channel = None;
        let closed_meanwhile = {
            let mut state = self.state.lock();
            if state.closed {
                true
            } else {
                state.inhibit_picker_updates = true;
                state.config = Some(new_config.clone());
                state.key_builders = key_builders;
                if let Some(channel) = &new_channel {
                    old_channel = state.control_channel.replace(Arc::clone(channel));
                }
                false
            }
        };

        if closed_meanwhile {
            if let Some(channel) = new_channel {
                channel.close().await;
            }
            return Err(RlsError::Shutdown);
        }

        // Child policy name and configuration; a new name rebuilds children
        self.registry.update_policy(
            new_config.child_policy.clone(),
            new_config.child_policy_config_target_field_name.clone(),
        );

        let old_default = old_config
            .as_ref()
            .and_then(|c| c.default_target().map(str::to_string));
        let new_default = new_config.default_target().map(str::to_string);
        if old_default != new_default {
            self.replace_default_target(new_default.as_deref());
        }

        let old_cache_size = old_config.as_ref().map(|c| c.cache_size());
        if old_cache_size != Some(new_config.cache_size()) {
            self.cache.lock().data.resize(new_config.cache_size());
        }

        self.state.lock().inhibit_picker_updates = false;
        self.publish_picker();

        if let Some(channel) = old_channel {
            channel.close().await;
        }

        info!(
            channel_target = %self.channel_target,
            lookup_service = %new_config.lookup_service,
            cache_size = new_config.cache_size(),
            default_target = ?new_config.default_target(),
            "Applied route lookup configuration"
        );
        Ok(())
    }

    async fn build_control_channel(
        self: &Arc<Self>,
        config: &RouteLookupConfig,
    ) -> RlsResult<ControlChannel> {
        let balancer = Arc::downgrade(self);
        let on_back_to_ready: BackToReadyCallback = Arc::new(move || {
            if let Some(balancer) = balancer.upgrade() {
                balancer.reset_backoff();
            }
        });

        ControlChannel::connect(
            &config.lookup_service,
            config.lookup_timeout(),
            self.connector.as_ref(),
            (self.throttler_factory)(),
            on_back_to_ready,
        )
        .await
    }

    fn replace_default_target(&self, target: Option<&str>) {
        let acquired = target.and_then(|t| {
            self.registry
                .acquire_references(&[t.to_string()])
                .into_iter()
                .next()
        });

        let previous = std::mem::replace(&mut self.state.lock().default_policy, acquired);
        if let Some(previous) = previous {
            self.registry
                .release_references(&[previous.target().to_string()]);
        }
    }

    fn update_child_state(
        self: &Arc<Self>,
        target: &str,
        connectivity: ConnectivityState,
        picker: Arc<dyn ChildPicker>,
    ) {
        if self.registry.update_state(target, connectivity, picker) {
            debug!(target = %target, state = %connectivity, "Child policy state changed");
            self.publish_picker();
        }
    }

    /// Publish a picker built from the current state, unless publication is
    /// inhibited, no configuration has been applied or the balancer is closed.
    ///
    /// The picker is handed to the client connection with the orchestration
    /// lock held, so pickers arrive in the order their state was observed.
    pub(crate) fn publish_picker(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || state.inhibit_picker_updates || state.config.is_none() {
            return;
        }

        let connectivity = self.registry.aggregated_state();
        state.connectivity = connectivity;

        let picker = Arc::new(RlsPicker {
            key_builders: Arc::clone(&state.key_builders),
            channel_target: self.channel_target.clone(),
            default_policy: state.default_policy.clone(),
            control_channel: state.control_channel.clone(),
            backoff_strategy: Arc::clone(&self.backoff_strategy),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            balancer: Arc::downgrade(self),
        });

        debug!(state = %connectivity, "Publishing new picker");
        self.client_conn.update_state(connectivity, picker);
    }

    /// Reconcile a lookup outcome into the cache, then publish a picker
    pub(crate) fn handle_lookup_response(
        self: &Arc<Self>,
        key: CacheKey,
        result: RlsResult<RouteLookupResponse>,
    ) {
        let ages = self
            .state
            .lock()
            .config
            .as_ref()
            .map(|c| (c.max_age(), c.stale_age()));

        if let Some((max_age, stale_age)) = ages {
            self.reconcile_lookup_response(&key, result, max_age, stale_age);
        }
        self.publish_picker();
    }

    fn reconcile_lookup_response(
        self: &Arc<Self>,
        key: &CacheKey,
        result: RlsResult<RouteLookupResponse>,
        max_age: Duration,
        stale_age: Option<Duration>,
    ) {
        let mut guard = self.cache.lock();
        let RouteCache { data, pending } = &mut *guard;
        let pending_backoff = pending.remove(key);
        if data.is_stopped() {
            return;
        }

        // A response that cannot fit is handled like a failed lookup
        let result = result.and_then(|response| {
            let size = key.entry_size(&response.header_data);
            if size > data.max_size() {
                Err(RlsError::entry_too_large(size, data.max_size()))
            } else {
                Ok(response)
            }
        });

        if data.peek_entry(key).is_none() {
            let entry = CacheEntry {
                size: key.entry_size(""),
                ..Default::default()
            };
            if !data.add_entry(key.clone(), entry).accepted {
                return;
            }
        }

        let now = Instant::now();
        match result {
            Ok(response) => self.apply_lookup_success(data, key, response, now, max_age, stale_age),
            Err(err) => self.apply_lookup_failure(data, key, pending_backoff, err, now),
        }
    }

    fn apply_lookup_failure(
        self: &Arc<Self>,
        data: &mut DataCache,
        key: &CacheKey,
        pending_backoff: Option<BackoffState>,
        err: RlsError,
        now: Instant,
    ) {
        let Some(entry) = data.get_entry_mut(key) else {
            return;
        };

        let mut backoff_state = pending_backoff
            .or_else(|| entry.backoff_state.as_ref().map(BackoffState::carry_over))
            .unwrap_or_else(|| BackoffState::new(Arc::clone(&self.backoff_strategy)));
        backoff_state.retries += 1;
        let backoff = backoff_state.strategy.backoff(backoff_state.retries);

        if let Some(previous) = entry.backoff_state.as_mut() {
            previous.cancel_timer();
        }

        let balancer = Arc::downgrade(self);
        backoff_state.timer = Some(BackoffTimer::spawn(backoff, move || {
            if let Some(balancer) = balancer.upgrade() {
                balancer.publish_picker();
            }
        }));

        warn!(
            key = %key,
            retries = backoff_state.retries,
            backoff = ?backoff,
            error = %err,
            "Route lookup failed, backing off"
        );

        entry.backoff_state = Some(backoff_state);
        entry.backoff_time = Some(now + backoff);
        entry.backoff_expiry_time = Some(now + 2 * backoff);
        entry.status = Some(err);
    }

    fn apply_lookup_success(
        &self,
        data: &mut DataCache,
        key: &CacheKey,
        response: RouteLookupResponse,
        now: Instant,
        max_age: Duration,
        stale_age: Option<Duration>,
    ) {
        let new_size = {
            let Some(entry) = data.get_entry_mut(key) else {
                return;
            };

            let mut targets: Vec<String> = Vec::with_capacity(response.targets.len());
            for target in response.targets {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }

            let old_targets = entry.targets();
            if old_targets != targets {
                let added: Vec<String> = targets
                    .iter()
                    .filter(|t| !old_targets.contains(t))
                    .cloned()
                    .collect();
                let removed: Vec<String> = old_targets
                    .iter()
                    .filter(|t| !targets.contains(t))
                    .cloned()
                    .collect();

                let acquired = self.registry.acquire_references(&added);
                let mut by_target: HashMap<String, Arc<ChildPolicyWrapper>> = entry
                    .child_policy_wrappers
                    .drain(..)
                    .chain(acquired)
                    .map(|w| (w.target().to_string(), w))
                    .collect();
                entry.child_policy_wrappers = targets
                    .iter()
                    .filter_map(|t| by_target.remove(t))
                    .collect();
                drop(by_target);

                if !removed.is_empty() {
                    self.registry.release_references(&removed);
                }
                debug!(key = %key, targets = ?targets, "Route lookup returned new targets");
            }

            if let Some(previous) = entry.backoff_state.as_mut() {
                previous.cancel_timer();
            }
            entry.backoff_state = None;
            entry.backoff_time = None;
            entry.backoff_expiry_time = None;
            entry.status = None;

            entry.header_data = response.header_data;
            entry.expiry_time = Some(now + max_age);
            entry.stale_time = stale_age.map(|age| now + age);
            entry.earliest_evict_time = Some(now + MIN_EVICT_DURATION);

            key.entry_size(&entry.header_data)
        };

        data.update_entry_size(key, new_size);
    }

    /// Forget retry history after the lookup server recovered
    fn reset_backoff(self: &Arc<Self>) {
        let reset = self
            .cache
            .lock()
            .data
            .reset_backoff_state(Arc::clone(&self.backoff_strategy));
        if reset {
            self.publish_picker();
        }
    }

    fn purge_expired_entries(self: &Arc<Self>) {
        let swept = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.cache.lock().data.evict_expired_entries()
        }));

        match swept {
            Ok(true) => self.publish_picker(),
            Ok(false) => {}
            Err(_) => error!("Expired entry sweep panicked, retrying on next tick"),
        }
    }

    async fn close(&self) {
        let taken = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                Some((state.control_channel.take(), state.default_policy.take()))
            }
        };
        let Some((control_channel, default_policy)) = taken else {
            return;
        };

        let purge_task = self.purge_task.lock().take();
        if let Some(task) = purge_task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Purge task exited abnormally");
            }
        }

        if let Some(channel) = control_channel {
            channel.close().await;
        }

        {
            let mut cache = self.cache.lock();
            cache.pending.clear();
            cache.data.stop();
        }

        if let Some(default_policy) = default_policy {
            self.registry
                .release_references(&[default_policy.target().to_string()]);
        }

        info!(channel_target = %self.channel_target, "Route lookup balancer closed");
    }
}

fn spawn_purge_task(shared: Weak<BalancerShared>, period: Duration) -> BackgroundTask {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    shared.purge_expired_entries();
                }
            }
        }

        debug!("Purge task stopped");
    });

    BackgroundTask {
        shutdown_tx,
        handle,
    }
}

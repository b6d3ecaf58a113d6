#![allow(dead_code)]

//! Fakes of the balancer's collaborators shared by the integration tests.

use async_trait::async_trait;
use hyper::HeaderMap;
use parking_lot::Mutex;
use rls_balancer::balancer::{
    ChildPicker, ChildPolicyGroup, ClientConnection, ConnectivityState, PickInfo, PickResult,
    RlsBalancer, RlsPicker,
};
use rls_balancer::config::{
    ChildPolicyConfig, ExtraKeys, GrpcKeyBuilder, NameMatcher, RouteLookupConfig,
    ServiceMethodName,
};
use rls_balancer::control_channel::{
    ConnectivityStream, RouteLookupClient, RouteLookupConnector, RouteLookupRequest,
    RouteLookupResponse,
};
use rls_balancer::error::{PickError, PickResultLabel, RlsError, RlsResult};
use rls_balancer::metrics::MetricsSink;
use rls_balancer::throttle::{Throttler, ThrottlerFactory};
use rls_balancer::FixedBackoff;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const METHOD: &str = "/echo.Echo/Unary";

/// Lookup client answering from a script of responses
pub struct FakeLookupClient {
    responses: Mutex<VecDeque<RlsResult<RouteLookupResponse>>>,
    fallback: Mutex<RlsResult<RouteLookupResponse>>,
    pub requests: Mutex<Vec<RouteLookupRequest>>,
    pub delay: Mutex<Option<Duration>>,
    states_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityState>>>,
    states_tx: mpsc::UnboundedSender<ConnectivityState>,
    pub closed: AtomicBool,
}

impl FakeLookupClient {
    /// Every lookup returns `response` unless a scripted one is queued
    pub fn new(response: RlsResult<RouteLookupResponse>) -> Arc<Self> {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(response),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            states_rx: Mutex::new(Some(states_rx)),
            states_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn returning(targets: &[&str], header_data: &str) -> Arc<Self> {
        Self::new(Ok(response(targets, header_data)))
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::new(Err(RlsError::unavailable(message)))
    }

    pub fn push_response(&self, result: RlsResult<RouteLookupResponse>) {
        self.responses.lock().push_back(result);
    }

    pub fn set_fallback(&self, result: RlsResult<RouteLookupResponse>) {
        *self.fallback.lock() = result;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn send_state(&self, state: ConnectivityState) {
        let _ = self.states_tx.send(state);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> Option<RouteLookupRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl RouteLookupClient for FakeLookupClient {
    async fn route_lookup(&self, request: RouteLookupRequest) -> RlsResult<RouteLookupResponse> {
        self.requests.lock().push(request);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.responses.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self.fallback.lock().clone(),
        }
    }

    fn connectivity_updates(&self) -> ConnectivityStream {
        match self.states_rx.lock().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::empty()),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out one shared client
pub struct FakeConnector {
    client: Arc<FakeLookupClient>,
    pub connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeLookupClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            connects: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RouteLookupConnector for FakeConnector {
    async fn connect(&self, lookup_service: &str) -> RlsResult<Arc<dyn RouteLookupClient>> {
        self.connects.lock().push(lookup_service.to_string());
        Ok(self.client.clone())
    }
}

/// Child policy group recording every call
#[derive(Default)]
pub struct FakeGroup {
    pub events: Mutex<Vec<String>>,
}

impl FakeGroup {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn removed(&self, target: &str) -> bool {
        self.events().contains(&format!("remove {}", target))
    }
}

impl ChildPolicyGroup for FakeGroup {
    fn add(&self, target: &str, policy_name: &str) {
        self.events.lock().push(format!("add {} {}", target, policy_name));
    }

    fn remove(&self, target: &str) {
        self.events.lock().push(format!("remove {}", target));
    }

    fn update_config(&self, target: &str, _config: &serde_json::Value) -> RlsResult<()> {
        self.events.lock().push(format!("config {}", target));
        Ok(())
    }
}

/// Channel collecting published pickers
pub struct FakeClientConn {
    pickers: Mutex<Vec<(ConnectivityState, Arc<RlsPicker>)>>,
    count_tx: watch::Sender<usize>,
}

impl FakeClientConn {
    pub fn new() -> Arc<Self> {
        let (count_tx, _) = watch::channel(0);
        Arc::new(Self {
            pickers: Mutex::new(Vec::new()),
            count_tx,
        })
    }

    pub fn update_count(&self) -> usize {
        self.pickers.lock().len()
    }

    pub fn latest(&self) -> Arc<RlsPicker> {
        self.pickers
            .lock()
            .last()
            .map(|(_, p)| p.clone())
            .expect("no picker published")
    }

    pub fn latest_state(&self) -> Option<ConnectivityState> {
        self.pickers.lock().last().map(|(s, _)| *s)
    }

    /// Wait until at least `count` pickers have been published
    pub async fn wait_for_updates(&self, count: usize) -> Arc<RlsPicker> {
        let mut rx = self.count_tx.subscribe();
        tokio::time::timeout(TEST_TIMEOUT, rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for picker")
            .expect("client connection dropped");
        self.latest()
    }
}

impl ClientConnection for FakeClientConn {
    fn update_state(&self, state: ConnectivityState, picker: Arc<RlsPicker>) {
        let count = {
            let mut pickers = self.pickers.lock();
            pickers.push((state, picker));
            pickers.len()
        };
        self.count_tx.send_replace(count);
    }
}

/// Child picker always choosing one endpoint
pub struct EndpointPicker(pub String);

impl ChildPicker for EndpointPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        Ok(PickResult {
            endpoint: self.0.clone(),
            metadata: HeaderMap::new(),
        })
    }
}

pub fn endpoint(target: &str) -> Arc<dyn ChildPicker> {
    Arc::new(EndpointPicker(target.to_string()))
}

/// Child picker failing every RPC
pub struct FailingPicker;

impl ChildPicker for FailingPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        Err(PickError::Failed(RlsError::unavailable("child down")))
    }
}

pub struct NeverThrottle;

impl Throttler for NeverThrottle {
    fn should_throttle(&self) -> bool {
        false
    }

    fn register_response(&self, _throttled: bool) {}
}

pub struct AlwaysThrottle;

impl Throttler for AlwaysThrottle {
    fn should_throttle(&self) -> bool {
        true
    }

    fn register_response(&self, _throttled: bool) {}
}

/// Throttler counting registered outcomes
#[derive(Default)]
pub struct RecordingThrottler {
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl Throttler for RecordingThrottler {
    fn should_throttle(&self) -> bool {
        false
    }

    fn register_response(&self, throttled: bool) {
        if throttled {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        } else {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn never_throttle() -> ThrottlerFactory {
    Arc::new(|| Arc::new(NeverThrottle) as Arc<dyn Throttler>)
}

pub fn always_throttle() -> ThrottlerFactory {
    Arc::new(|| Arc::new(AlwaysThrottle) as Arc<dyn Throttler>)
}

/// Metrics sink keeping every recorded value
#[derive(Default)]
pub struct RecordingMetrics {
    pub target_picks: Mutex<Vec<(String, PickResultLabel)>>,
    pub default_picks: Mutex<Vec<(String, PickResultLabel)>>,
    pub failed_picks: AtomicUsize,
    pub cache_entries: AtomicUsize,
    pub cache_size: AtomicUsize,
}

impl MetricsSink for RecordingMetrics {
    fn record_cache_entries(&self, entries: u64) {
        self.cache_entries.store(entries as usize, Ordering::SeqCst);
    }

    fn record_cache_size(&self, bytes: u64) {
        self.cache_size.store(bytes as usize, Ordering::SeqCst);
    }

    fn record_default_target_pick(&self, target: &str, result: PickResultLabel) {
        self.default_picks.lock().push((target.to_string(), result));
    }

    fn record_target_pick(&self, target: &str, result: PickResultLabel) {
        self.target_picks.lock().push((target.to_string(), result));
    }

    fn record_failed_pick(&self) {
        self.failed_picks.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn response(targets: &[&str], header_data: &str) -> RouteLookupResponse {
    RouteLookupResponse {
        targets: targets.iter().map(|t| t.to_string()).collect(),
        header_data: header_data.to_string(),
    }
}

/// Config keyed on the `x-user` header of `/echo.Echo/*`
pub fn route_lookup_config() -> RouteLookupConfig {
    RouteLookupConfig {
        key_builders: vec![GrpcKeyBuilder {
            names: vec![ServiceMethodName {
                service: "echo.Echo".to_string(),
                method: None,
            }],
            headers: vec![NameMatcher {
                key: "user".to_string(),
                names: vec!["x-user".to_string()],
                required_match: false,
            }],
            extra_keys: ExtraKeys::default(),
            constant_keys: BTreeMap::new(),
        }],
        lookup_service: "rls.test:443".to_string(),
        lookup_service_timeout: 10,
        max_age: Some(60),
        stale_age: None,
        cache_size_bytes: 4096,
        default_target: None,
        child_policy: ChildPolicyConfig {
            name: "pick_first".to_string(),
            config: serde_json::json!({}),
        },
        child_policy_config_target_field_name: "target".to_string(),
    }
}

pub fn pick_info(user: &str) -> PickInfo {
    let mut info = PickInfo::new(METHOD);
    info.metadata.insert(
        "x-user",
        user.parse().expect("valid header value"),
    );
    info
}

/// Balancer wired to fakes
pub struct Harness {
    pub balancer: RlsBalancer,
    pub conn: Arc<FakeClientConn>,
    pub group: Arc<FakeGroup>,
    pub client: Arc<FakeLookupClient>,
    pub connector: Arc<FakeConnector>,
    pub metrics: Arc<RecordingMetrics>,
}

impl Harness {
    pub fn new(client: Arc<FakeLookupClient>, throttler: ThrottlerFactory) -> Self {
        Self::with_backoff(client, throttler, Duration::from_secs(30))
    }

    pub fn with_backoff(
        client: Arc<FakeLookupClient>,
        throttler: ThrottlerFactory,
        backoff: Duration,
    ) -> Self {
        let conn = FakeClientConn::new();
        let group = Arc::new(FakeGroup::default());
        let connector = FakeConnector::new(client.clone());
        let metrics = Arc::new(RecordingMetrics::default());

        let balancer = RlsBalancer::builder(
            "echo.example.com",
            conn.clone(),
            group.clone(),
            connector.clone(),
        )
        .with_metrics(metrics.clone())
        .with_purge_interval(Duration::from_secs(3600))
        .with_backoff_strategy(Arc::new(FixedBackoff::new(backoff)))
        .with_throttler_factory(throttler)
        .build();

        Self {
            balancer,
            conn,
            group,
            client,
            connector,
            metrics,
        }
    }
}

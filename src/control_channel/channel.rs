use super::{
    ConnectivityTracker, LookupReason, MonitorAction, RouteLookupClient, RouteLookupConnector,
    RouteLookupRequest, RouteLookupResponse, TARGET_TYPE_GRPC,
};
use crate::error::{RlsError, RlsResult};
use crate::throttle::Throttler;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Receives the outcome of a lookup, exactly once
pub type LookupCallback = Box<dyn FnOnce(RlsResult<RouteLookupResponse>) + Send + 'static>;

/// Invoked when the lookup server connection recovers from a failure
pub type BackToReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Client of one route lookup server
pub struct ControlChannel {
    lookup_service: String,
    client: Arc<dyn RouteLookupClient>,
    throttler: Arc<dyn Throttler>,
    rpc_timeout: Duration,
    runtime: Handle,
    shutdown_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ControlChannel {
    /// Connect to `lookup_service` and start monitoring the connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn connect(
        lookup_service: &str,
        rpc_timeout: Duration,
        connector: &dyn RouteLookupConnector,
        throttler: Arc<dyn Throttler>,
        on_back_to_ready: BackToReadyCallback,
    ) -> RlsResult<Self> {
        let client = connector.connect(lookup_service).await?;
        info!(
            lookup_service = %lookup_service,
            timeout = ?rpc_timeout,
            "Created control channel to route lookup service"
        );
        Ok(Self::new(
            lookup_service,
            client,
            rpc_timeout,
            throttler,
            on_back_to_ready,
        ))
    }

    /// Wrap an existing client. Must be called from within a Tokio runtime.
    pub fn new(
        lookup_service: &str,
        client: Arc<dyn RouteLookupClient>,
        rpc_timeout: Duration,
        throttler: Arc<dyn Throttler>,
        on_back_to_ready: BackToReadyCallback,
    ) -> Self {
        let runtime = Handle::current();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = runtime.spawn(monitor_connectivity(
            lookup_service.to_string(),
            Arc::clone(&client),
            shutdown_rx,
            on_back_to_ready,
        ));

        Self {
            lookup_service: lookup_service.to_string(),
            client,
            throttler,
            rpc_timeout,
            runtime,
            shutdown_tx,
            monitor: Mutex::new(Some(monitor)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn lookup_service(&self) -> &str {
        &self.lookup_service
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Start a lookup.
    ///
    /// Returns true if the request was throttled; the callback is then
    /// dropped without being called. Otherwise the callback runs once the
    /// RPC completes, fails, times out or panics. A response without targets
    /// is reported as an error.
    pub fn lookup(
        &self,
        key_map: BTreeMap<String, String>,
        reason: LookupReason,
        stale_header_data: String,
        callback: LookupCallback,
    ) -> bool {
        if self.throttler.should_throttle() {
            debug!(keys = ?key_map, "Route lookup throttled");
            return true;
        }

        let request = RouteLookupRequest {
            target_type: TARGET_TYPE_GRPC.to_string(),
            key_map,
            reason,
            stale_header_data,
        };
        let client = Arc::clone(&self.client);
        let throttler = Arc::clone(&self.throttler);
        let rpc_timeout = self.rpc_timeout;

        self.runtime.spawn(async move {
            debug!(keys = ?request.key_map, reason = %reason, "Sending route lookup");
            let keys = request.key_map.clone();

            let mut rpc = tokio::spawn(async move { client.route_lookup(request).await });
            let result = match tokio::time::timeout(rpc_timeout, &mut rpc).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!(keys = ?keys, error = %e, "Route lookup task failed");
                    Err(RlsError::internal(format!("route lookup task failed: {}", e)))
                }
                Err(_) => {
                    rpc.abort();
                    Err(RlsError::timeout(rpc_timeout, "route lookup"))
                }
            };
            throttler.register_response(result.is_err());

            let result = result.and_then(|response| {
                if response.targets.is_empty() {
                    Err(RlsError::empty_targets(format_keys(&keys)))
                } else {
                    Ok(response)
                }
            });

            if let Err(e) = &result {
                debug!(keys = ?keys, error = %e, "Route lookup failed");
            }
            callback(result);
        });

        false
    }

    /// Stop the connectivity monitor and close the client. Later calls are
    /// no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Connectivity monitor exited abnormally");
            }
        }

        self.client.close().await;
        info!(lookup_service = %self.lookup_service, "Control channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("lookup_service", &self.lookup_service)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn monitor_connectivity(
    lookup_service: String,
    client: Arc<dyn RouteLookupClient>,
    mut shutdown_rx: watch::Receiver<bool>,
    on_back_to_ready: BackToReadyCallback,
) {
    let mut updates = client.connectivity_updates();
    let mut tracker = ConnectivityTracker::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = updates.next() => {
                let Some(state) = next else {
                    break;
                };

                match tracker.observe(state) {
                    MonitorAction::Continue => {
                        debug!(lookup_service = %lookup_service, state = %state, "Control channel state changed");
                    }
                    MonitorAction::BackToReady => {
                        info!(
                            lookup_service = %lookup_service,
                            "Control channel back to READY after TRANSIENT_FAILURE, resetting backoff"
                        );
                        if panic::catch_unwind(AssertUnwindSafe(|| on_back_to_ready())).is_err() {
                            error!(lookup_service = %lookup_service, "Back to READY callback panicked");
                        }
                    }
                    MonitorAction::Stop => break,
                }
            }
        }
    }

    debug!(lookup_service = %lookup_service, "Connectivity monitor stopped");
}

fn format_keys(keys: &BTreeMap<String, String>) -> String {
    keys.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

//! # Control channel
//!
//! Client side of the route lookup protocol. The transport is supplied by
//! the caller ([`RouteLookupConnector`] / [`RouteLookupClient`]); this module
//! adds deadlines, client side throttling and connectivity monitoring.

pub mod channel; // lookups with deadline and throttling
pub mod monitor; // lookup server connectivity tracking

use crate::balancer::ConnectivityState;
use crate::error::RlsResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

pub use channel::{ControlChannel, LookupCallback};
pub use monitor::{ConnectivityTracker, MonitorAction};

/// Target type sent with every lookup
pub const TARGET_TYPE_GRPC: &str = "grpc";

/// Why a lookup is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupReason {
    /// No usable cache entry
    Miss,
    /// Refresh of an entry past its stale age
    Stale,
}

impl fmt::Display for LookupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupReason::Miss => write!(f, "MISS"),
            LookupReason::Stale => write!(f, "STALE"),
        }
    }
}

/// Route lookup request
#[derive(Debug, Clone, PartialEq)]
pub struct RouteLookupRequest {
    pub target_type: String,
    pub key_map: BTreeMap<String, String>,
    pub reason: LookupReason,
    /// Header data of the entry being refreshed
    pub stale_header_data: String,
}

/// Route lookup response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteLookupResponse {
    /// Targets in order of preference
    pub targets: Vec<String>,
    /// Opaque data forwarded to the chosen backend
    pub header_data: String,
}

/// Stream of connectivity states of the lookup server connection
pub type ConnectivityStream = Pin<Box<dyn Stream<Item = ConnectivityState> + Send>>;

/// Connection to a route lookup server
#[async_trait]
pub trait RouteLookupClient: Send + Sync {
    /// Perform a single lookup
    async fn route_lookup(&self, request: RouteLookupRequest) -> RlsResult<RouteLookupResponse>;

    /// Connectivity changes of the underlying connection, starting with the
    /// current state
    fn connectivity_updates(&self) -> ConnectivityStream;

    /// Release the connection
    async fn close(&self);
}

/// Opens connections to route lookup servers
#[async_trait]
pub trait RouteLookupConnector: Send + Sync {
    async fn connect(&self, lookup_service: &str) -> RlsResult<Arc<dyn RouteLookupClient>>;
}

//! # Route lookup balancer
//!
//! The balancer maps every RPC to a target returned by the route lookup
//! server and delegates the connection pick to a per-target child policy.
//!
//! ## Components
//!
//! - **Picker** ([`RlsPicker`]): per-RPC decision. Serves from the data
//!   cache, queues the RPC while a lookup is in flight, or falls back to the
//!   default target.
//! - **Child policies** ([`ChildPolicyRegistry`]): reference counted
//!   wrappers around the child policies living in the owning channel.
//! - **Orchestration** ([`RlsBalancer`]): configuration updates, child state
//!   aggregation and picker publication.
//!
//! ## Collaborators
//!
//! The child policies themselves, the channel that receives pickers and the
//! lookup transport are supplied by the caller through [`ChildPolicyGroup`],
//! [`ClientConnection`] and
//! [`RouteLookupConnector`](crate::control_channel::RouteLookupConnector).
//!
//! ## Example
//!
//! ```rust,no_run
//! use rls_balancer::balancer::{ChildPolicyGroup, ClientConnection, RlsBalancer};
//! use rls_balancer::config::RlsConfig;
//! use rls_balancer::control_channel::RouteLookupConnector;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     conn: Arc<dyn ClientConnection>,
//! #     group: Arc<dyn ChildPolicyGroup>,
//! #     connector: Arc<dyn RouteLookupConnector>,
//! # ) -> anyhow::Result<()> {
//! let config = RlsConfig::from_file_with_env("config/rls.toml").await?;
//! let balancer = RlsBalancer::builder("service.example.com", conn, group, connector).build();
//! balancer.update_config(config.route_lookup).await?;
//! // ...
//! balancer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod child_policy; // reference counted child policy wrappers
pub mod picker; // per-RPC routing decisions
pub mod rls; // configuration, state aggregation, lookup responses

use crate::error::{PickError, RlsResult};
use hyper::HeaderMap;
use std::fmt;
use std::sync::Arc;

pub use child_policy::{ChildPolicyRegistry, ChildPolicyState, ChildPolicyWrapper};
pub use picker::{RlsPicker, RLS_DATA_HEADER};
pub use rls::{CacheStats, RlsBalancer, RlsBalancerBuilder};

/// Connectivity state of a channel, a child policy or the lookup server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "IDLE"),
            ConnectivityState::Connecting => write!(f, "CONNECTING"),
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ConnectivityState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// What a picker knows about the RPC being routed
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    /// `/service/method`
    pub full_method: String,
    /// Outgoing request metadata
    pub metadata: HeaderMap,
}

impl PickInfo {
    pub fn new<S: Into<String>>(full_method: S) -> Self {
        Self {
            full_method: full_method.into(),
            metadata: HeaderMap::new(),
        }
    }
}

/// Successful pick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PickResult {
    /// Endpoint chosen by the child policy
    pub endpoint: String,
    /// Metadata to attach to the outgoing RPC
    pub metadata: HeaderMap,
}

/// Picker of a child policy
pub trait ChildPicker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError>;
}

/// The set of child policies, one per target, owned by the channel.
///
/// Implementations must not call back into the balancer synchronously from
/// these methods; state changes are reported later through
/// [`RlsBalancer::update_child_state`].
pub trait ChildPolicyGroup: Send + Sync {
    /// Instantiate a child policy named `policy_name` for `target`
    fn add(&self, target: &str, policy_name: &str);

    /// Shut down the child policy of `target`
    fn remove(&self, target: &str);

    /// Push a configuration to the child policy of `target`
    fn update_config(&self, target: &str, config: &serde_json::Value) -> RlsResult<()>;
}

/// Channel receiving picker updates.
///
/// Calls are serialized and arrive in publication order. Like
/// [`ChildPolicyGroup`], implementations must not re-enter the balancer
/// from `update_state`.
pub trait ClientConnection: Send + Sync {
    fn update_state(&self, state: ConnectivityState, picker: Arc<RlsPicker>);
}

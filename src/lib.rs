//! # rls-balancer - Route Lookup Service caching load balancer
//!
//! A per-RPC routing policy that asks an external route lookup server which
//! target should serve a request, caches the answer and delegates the
//! connection pick to a child policy per target.
//!
//! ## Core features
//!
//! - **Data cache**: size bounded LRU cache with max age, stale refresh and
//!   exponential backoff after failed lookups
//! - **Lookup deduplication**: concurrent identical RPCs trigger one lookup
//! - **Control channel**: lookup deadline, client side adaptive throttling
//!   and backoff reset when the lookup server recovers
//! - **Child policies**: reference counted per-target child policies with
//!   aggregated connectivity
//! - **Default target**: fallback for throttled or failing lookups
//!
//! ## Example
//!
//! ```rust,no_run
//! use rls_balancer::{PickInfo, RlsBalancer, RlsConfig};
//! # use rls_balancer::balancer::{ChildPolicyGroup, ClientConnection};
//! # use rls_balancer::control_channel::RouteLookupConnector;
//! # use std::sync::Arc;
//!
//! # async fn example(
//! #     conn: Arc<dyn ClientConnection>,
//! #     group: Arc<dyn ChildPolicyGroup>,
//! #     connector: Arc<dyn RouteLookupConnector>,
//! # ) -> anyhow::Result<()> {
//! let config = RlsConfig::from_file_with_env("config/rls.toml").await?;
//! let balancer = RlsBalancer::builder("service.example.com", conn, group, connector).build();
//! balancer.update_config(config.route_lookup).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod control_channel;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod throttle;

// Re-export commonly used types
pub use backoff::{BackoffConfig, BackoffStrategy, ExponentialBackoff, FixedBackoff};
pub use balancer::{
    CacheStats, ChildPicker, ChildPolicyGroup, ClientConnection, ConnectivityState, PickInfo,
    PickResult, RlsBalancer, RlsPicker, RLS_DATA_HEADER,
};
pub use cache::{CacheEntry, CacheKey, DataCache};
pub use config::{RlsConfig, RouteLookupConfig};
pub use control_channel::{
    LookupReason, RouteLookupClient, RouteLookupConnector, RouteLookupRequest,
    RouteLookupResponse,
};
pub use error::{PickError, RlsError, RlsResult};
pub use keys::{KeyBuilderMap, RequestKeys};
pub use metrics::{MetricsSink, NoopMetrics, RecorderMetrics};
pub use throttle::{AdaptiveThrottler, Throttler, ThrottlerConfig};

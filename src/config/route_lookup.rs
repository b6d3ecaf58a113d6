use crate::error::{RlsError, RlsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Upper bound (and default) for `max_age`
pub const MAX_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Upper bound for `cache_size_bytes`
pub const MAX_CACHE_SIZE: u64 = 5 * 1024 * 1024;

/// Default deadline for a single route lookup RPC
pub const DEFAULT_LOOKUP_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Route lookup policy configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteLookupConfig {
    /// Request fingerprinting rules
    #[serde(default)]
    pub key_builders: Vec<GrpcKeyBuilder>,
    /// Address of the route lookup server
    pub lookup_service: String,
    /// Deadline for a single lookup, in seconds
    #[serde(default = "default_lookup_service_timeout")]
    pub lookup_service_timeout: u64,
    /// How long a successful response stays valid, in seconds
    #[serde(default)]
    pub max_age: Option<u64>,
    /// After how long a valid entry is proactively refreshed, in seconds
    #[serde(default)]
    pub stale_age: Option<u64>,
    /// Data cache capacity
    pub cache_size_bytes: u64,
    /// Target used when no lookup result is usable
    #[serde(default)]
    pub default_target: Option<String>,
    /// Policy instantiated for every target
    pub child_policy: ChildPolicyConfig,
    /// Field of the child policy config that receives the target name
    #[serde(default = "default_target_field_name")]
    pub child_policy_config_target_field_name: String,
}

fn default_lookup_service_timeout() -> u64 {
    DEFAULT_LOOKUP_SERVICE_TIMEOUT.as_secs()
}

fn default_target_field_name() -> String {
    "target".to_string()
}

/// Key builder for one or more gRPC services/methods
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GrpcKeyBuilder {
    pub names: Vec<ServiceMethodName>,
    #[serde(default)]
    pub headers: Vec<NameMatcher>,
    #[serde(default)]
    pub extra_keys: ExtraKeys,
    #[serde(default)]
    pub constant_keys: BTreeMap<String, String>,
}

/// A service and optional method; a missing method matches the whole service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ServiceMethodName {
    pub service: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// Extracts a key from the first present header among `names`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NameMatcher {
    pub key: String,
    pub names: Vec<String>,
    #[serde(default)]
    pub required_match: bool,
}

/// Key names for request attributes that are not headers
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ExtraKeys {
    pub host: Option<String>,
    pub service: Option<String>,
    pub method: Option<String>,
}

/// Child policy selection
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChildPolicyConfig {
    /// Registered policy name
    pub name: String,
    /// Policy specific JSON configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ChildPolicyConfig {
    /// Configuration handed to the child policy of `target`: the JSON object
    /// with `field_name` set to the target name.
    pub fn build_for_target(&self, field_name: &str, target: &str) -> RlsResult<serde_json::Value> {
        if field_name.is_empty() {
            return Err(RlsError::child_policy(
                target,
                "child policy config target field name is empty",
            ));
        }

        let mut object = match &self.config {
            serde_json::Value::Null => serde_json::Map::new(),
            serde_json::Value::Object(map) => map.clone(),
            other => {
                return Err(RlsError::child_policy(
                    target,
                    format!("child policy config must be a JSON object, got {}", other),
                ))
            }
        };

        object.insert(
            field_name.to_string(),
            serde_json::Value::String(target.to_string()),
        );
        Ok(serde_json::Value::Object(object))
    }
}

impl RouteLookupConfig {
    /// Validate the route lookup configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lookup_service.trim().is_empty() {
            return Err(anyhow::anyhow!("lookup_service cannot be empty"));
        }

        if self.cache_size_bytes == 0 {
            return Err(anyhow::anyhow!("cache_size_bytes must be greater than 0"));
        }

        if self.lookup_service_timeout == 0 {
            return Err(anyhow::anyhow!(
                "lookup_service_timeout must be greater than 0"
            ));
        }

        if self.child_policy.name.trim().is_empty() {
            return Err(anyhow::anyhow!("child_policy.name cannot be empty"));
        }

        if self.child_policy_config_target_field_name.is_empty() {
            return Err(anyhow::anyhow!(
                "child_policy_config_target_field_name cannot be empty"
            ));
        }

        if !matches!(
            self.child_policy.config,
            serde_json::Value::Null | serde_json::Value::Object(_)
        ) {
            return Err(anyhow::anyhow!("child_policy.config must be a table"));
        }

        if self.stale_age.is_some() && self.max_age.is_none() {
            warn!("stale_age is set without max_age and will be ignored");
        }

        crate::keys::KeyBuilderMap::new(&self.key_builders)?;

        Ok(())
    }

    /// Lookup RPC deadline
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_service_timeout)
    }

    /// Effective max age, capped at five minutes
    pub fn max_age(&self) -> Duration {
        match self.max_age {
            Some(secs) => Duration::from_secs(secs).min(MAX_MAX_AGE),
            None => MAX_MAX_AGE,
        }
    }

    /// Effective stale age. Only honored together with `max_age`, and never
    /// longer than it.
    pub fn stale_age(&self) -> Option<Duration> {
        self.max_age?;
        let stale = Duration::from_secs(self.stale_age?);
        Some(stale.min(self.max_age()))
    }

    /// Effective cache capacity in bytes
    pub fn cache_size(&self) -> u64 {
        self.cache_size_bytes.min(MAX_CACHE_SIZE)
    }

    /// Configured default target, if any
    pub fn default_target(&self) -> Option<&str> {
        self.default_target.as_deref().filter(|t| !t.is_empty())
    }

    /// Copy with every limit applied, as the balancer sees it
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.max_age = Some(self.max_age().as_secs());
        config.stale_age = self.stale_age().map(|d| d.as_secs());
        config.cache_size_bytes = self.cache_size();
        config.default_target = self.default_target().map(str::to_string);
        config
    }

    /// Whether a switch to `other` needs a new control channel
    pub fn control_channel_changed(&self, other: &RouteLookupConfig) -> bool {
        self.lookup_service != other.lookup_service
            || self.lookup_service_timeout != other.lookup_service_timeout
    }
}

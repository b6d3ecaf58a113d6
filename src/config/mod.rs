//! # Configuration
//!
//! Configuration for the route lookup balancer:
//!
//! - TOML file parsing and validation
//! - environment variable expansion (`${VAR}` and `${VAR:-default}`)
//! - normalization of ages and cache size limits
//!
//! ## Example
//!
//! ```rust,no_run
//! use rls_balancer::config::RlsConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RlsConfig::from_file_with_env("config/rls.toml").await?;
//! println!("lookup service: {}", config.route_lookup.lookup_service);
//! # Ok(())
//! # }
//! ```

pub mod logging; // tracing subscriber settings
pub mod route_lookup; // lookup service, cache and child policy settings

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{info, warn};

pub use logging::{LogFormat, LoggingConfig};
pub use route_lookup::{
    ChildPolicyConfig, ExtraKeys, GrpcKeyBuilder, NameMatcher, RouteLookupConfig,
    ServiceMethodName, DEFAULT_LOOKUP_SERVICE_TIMEOUT, MAX_CACHE_SIZE, MAX_MAX_AGE,
};

/// Top level configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RlsConfig {
    /// Lookup service, cache and child policy configuration
    pub route_lookup: RouteLookupConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RlsConfig {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded_content = expand_env_vars(&content);

        let config = Self::from_toml_str(&expanded_content)?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RlsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.route_lookup.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Expand environment variables in configuration content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let mut search_from = 0;

    while let Some(offset) = result[search_from..].find("${") {
        let start = search_from + offset;
        let Some(end) = result[start..].find('}') else {
            break; // Malformed ${VAR expression
        };

        let var_expr = &result[start + 2..start + end];
        let replacement = if let Some(default_pos) = var_expr.find(":-") {
            let var_name = &var_expr[..default_pos];
            let default_value = &var_expr[default_pos + 2..];
            env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        } else {
            env::var(var_expr).unwrap_or_else(|_| {
                warn!(
                    "Environment variable '{}' not found, using empty string",
                    var_expr
                );
                String::new()
            })
        };

        result.replace_range(start..start + end + 1, &replacement);
        search_from = start + replacement.len();
    }

    result
}

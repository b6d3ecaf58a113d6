use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default level for the crate's targets (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
    /// Extra `target=level` directives appended to the filter
    #[serde(default)]
    pub directives: Vec<String>,
}

/// Log line formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

const VALID_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Full,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !VALID_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}', expected one of {:?}",
                self.level,
                VALID_LEVELS
            ));
        }

        for directive in &self.directives {
            if directive.trim().is_empty() {
                return Err(anyhow::anyhow!("Log directives cannot be empty"));
            }
        }

        Ok(())
    }

    /// Filter string for `tracing_subscriber::EnvFilter`.
    ///
    /// `verbose` forces debug output for this crate.
    pub fn filter_directives(&self, verbose: bool) -> String {
        let level = if verbose {
            "debug".to_string()
        } else {
            self.level.to_lowercase()
        };

        let mut filter = format!("rls_balancer={}", level);
        for directive in &self.directives {
            filter.push(',');
            filter.push_str(directive.trim());
        }
        filter
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` takes precedence over the configured directives.
    pub fn init_tracing(&self, verbose: bool) {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter_directives(verbose)));

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = match self.format {
            LogFormat::Full => builder.try_init(),
            LogFormat::Compact => builder.compact().try_init(),
        };

        if let Err(e) = result {
            tracing::debug!("Tracing subscriber already installed: {}", e);
        }
    }
}

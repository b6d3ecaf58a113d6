use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the route lookup balancer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RlsError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Lookup server or routing data is unavailable
    #[error("Unavailable: {message}")]
    Unavailable { message: String },

    /// Lookup succeeded but returned no targets
    #[error("Route lookup response contains no targets for keys {keys}")]
    EmptyTargets { keys: String },

    /// Lookup was withheld by client side throttling
    #[error("Route lookup request throttled at client side")]
    Throttled,

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// A child policy could not be configured
    #[error("Child policy error: {target}: {message}")]
    ChildPolicy { target: String, message: String },

    /// Entry does not fit in the data cache
    #[error("Cache entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: u64, capacity: u64 },

    /// Balancer has been closed
    #[error("Balancer is shut down")]
    Shutdown,

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RlsError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create an empty target list error
    pub fn empty_targets<S: Into<String>>(keys: S) -> Self {
        Self::EmptyTargets { keys: keys.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a child policy error
    pub fn child_policy<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        Self::ChildPolicy {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an oversized cache entry error
    pub fn entry_too_large(size: u64, capacity: u64) -> Self {
        Self::EntryTooLarge { size, capacity }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Human readable detail without the variant prefix.
    ///
    /// Used when a lookup failure is surfaced on the data plane: only the
    /// message travels, never the upstream error kind.
    pub fn message(&self) -> String {
        match self {
            RlsError::Config { message }
            | RlsError::Unavailable { message }
            | RlsError::Internal { message } => message.clone(),
            RlsError::ChildPolicy { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for balancer operations
pub type RlsResult<T> = Result<T, RlsError>;

/// Error returned by a picker
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PickError {
    /// No connection is ready yet; the RPC should wait for the next picker
    #[error("no connection available, pick queued")]
    Queue,

    /// The RPC should fail with the given error
    #[error(transparent)]
    Failed(#[from] RlsError),
}

impl PickError {
    /// Label used when recording pick metrics
    pub fn result_label(&self) -> PickResultLabel {
        match self {
            PickError::Queue => PickResultLabel::Queue,
            PickError::Failed(_) => PickResultLabel::Fail,
        }
    }
}

/// Outcome of a pick as seen by metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickResultLabel {
    Complete,
    Queue,
    Fail,
}

impl fmt::Display for PickResultLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickResultLabel::Complete => write!(f, "complete"),
            PickResultLabel::Queue => write!(f, "queue"),
            PickResultLabel::Fail => write!(f, "fail"),
        }
    }
}

/// Convert from anyhow::Error to RlsError
impl From<anyhow::Error> for RlsError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(rls_err) = err.downcast_ref::<RlsError>() {
            return rls_err.clone();
        }

        RlsError::config(err.to_string())
    }
}

/// Convert from toml::de::Error to RlsError
impl From<toml::de::Error> for RlsError {
    fn from(err: toml::de::Error) -> Self {
        RlsError::config(format!("TOML parsing error: {}", err))
    }
}

/// Convert from serde_json::Error to RlsError
impl From<serde_json::Error> for RlsError {
    fn from(err: serde_json::Error) -> Self {
        RlsError::config(format!("JSON error: {}", err))
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Computes how long to wait before the next lookup for a key that failed
/// `retries` times in a row.
pub trait BackoffStrategy: fmt::Debug + Send + Sync {
    fn backoff(&self, retries: u32) -> Duration;
}

/// Shared handle to a backoff strategy
pub type SharedBackoff = Arc<dyn BackoffStrategy>;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Randomization factor, delays vary by ±jitter
    pub jitter: f64,
    /// Upper bound on the delay before jitter
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Shared instance using the default configuration
    pub fn shared_default() -> SharedBackoff {
        Arc::new(Self::default())
    }

    /// Delay before jitter is applied
    fn base_delay_for(&self, retries: u32) -> f64 {
        let max = self.config.max_delay.as_secs_f64();
        let mut delay = self.config.base_delay.as_secs_f64();
        let mut remaining = retries;

        while delay < max && remaining > 0 {
            delay *= self.config.multiplier;
            remaining -= 1;
        }

        delay.min(max)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn backoff(&self, retries: u32) -> Duration {
        if retries == 0 {
            return self.config.base_delay;
        }

        let delay = add_jitter(self.base_delay_for(retries), self.config.jitter);
        Duration::from_secs_f64(delay)
    }
}

/// Add random jitter to a delay in seconds (±jitter)
fn add_jitter(seconds: f64, jitter: f64) -> f64 {
    use rand::Rng;

    if jitter <= 0.0 {
        return seconds;
    }

    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(-1.0..=1.0);
    (seconds * (1.0 + jitter * factor)).max(0.0)
}

/// Fixed delay regardless of retry count
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn backoff(&self, _retries: u32) -> Duration {
        self.delay
    }
}

impl fmt::Display for BackoffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EXPONENTIAL(base={:?}, multiplier={}, jitter={}, max={:?})",
            self.base_delay, self.multiplier, self.jitter, self.max_delay
        )
    }
}

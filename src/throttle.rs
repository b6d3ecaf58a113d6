//! Client side adaptive throttling for route lookups.
//!
//! The throttler keeps a sliding window of lookups the server accepted and
//! lookups that were rejected (or withheld locally). When the rejection rate
//! climbs, new lookups are dropped with increasing probability before they
//! ever reach the wire:
//!
//! ```text
//! p(throttle) = max(0, (requests - ratio * accepts) / (requests + padding))
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Decides whether a lookup should be withheld.
pub trait Throttler: Send + Sync {
    /// Returns true if the next request should be dropped locally.
    fn should_throttle(&self) -> bool;

    /// Records the outcome of a request that reached the server.
    fn register_response(&self, throttled: bool);
}

/// Builds a fresh throttler for every control channel.
pub type ThrottlerFactory = Arc<dyn Fn() -> Arc<dyn Throttler> + Send + Sync>;

/// Configuration for the adaptive throttler
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlerConfig {
    /// Length of the lookback window
    pub window: Duration,
    /// Number of bins the window is divided into
    pub bins: usize,
    /// Multiplier applied to accepted requests
    pub ratio_for_accepts: f64,
    /// Padding added to the request count
    pub requests_padding: f64,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            bins: 100,
            ratio_for_accepts: 2.0,
            requests_padding: 8.0,
        }
    }
}

type RandomSource = Box<dyn Fn() -> f64 + Send + Sync>;

/// Adaptive throttler backed by two lookback windows.
pub struct AdaptiveThrottler {
    config: ThrottlerConfig,
    counters: Mutex<Counters>,
    random: RandomSource,
}

struct Counters {
    accepts: Lookback,
    throttles: Lookback,
}

impl AdaptiveThrottler {
    /// Create a throttler with the given configuration
    pub fn new(config: ThrottlerConfig) -> Self {
        Self::with_random(config, Box::new(|| rand::random::<f64>()))
    }

    /// Create a throttler with a custom random source in `[0, 1)`
    pub fn with_random(config: ThrottlerConfig, random: RandomSource) -> Self {
        let epoch = Instant::now();
        let counters = Counters {
            accepts: Lookback::new(config.window, config.bins, epoch),
            throttles: Lookback::new(config.window, config.bins, epoch),
        };
        Self {
            config,
            counters: Mutex::new(counters),
            random,
        }
    }

    /// Factory producing default throttlers
    pub fn default_factory() -> ThrottlerFactory {
        Arc::new(|| Arc::new(AdaptiveThrottler::new(ThrottlerConfig::default())) as Arc<dyn Throttler>)
    }

    /// Current (accepts, throttles) within the window
    pub fn counts(&self) -> (u64, u64) {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        (counters.accepts.sum(now), counters.throttles.sum(now))
    }

    fn throttle_probability(&self, accepts: f64, throttles: f64) -> f64 {
        let requests = accepts + throttles;
        (requests - self.config.ratio_for_accepts * accepts)
            / (requests + self.config.requests_padding)
    }
}

impl Throttler for AdaptiveThrottler {
    fn should_throttle(&self) -> bool {
        let random = (self.random)();
        let now = Instant::now();

        let mut counters = self.counters.lock();
        let accepts = counters.accepts.sum(now) as f64;
        let throttles = counters.throttles.sum(now) as f64;
        let probability = self.throttle_probability(accepts, throttles);

        if probability <= random {
            return false;
        }

        counters.throttles.add(now, 1);
        debug!(
            accepts = accepts,
            throttles = throttles,
            probability = probability,
            "Throttling route lookup"
        );
        true
    }

    fn register_response(&self, throttled: bool) {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        if throttled {
            counters.throttles.add(now, 1);
        } else {
            counters.accepts.add(now, 1);
        }
    }
}

impl fmt::Debug for AdaptiveThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveThrottler")
            .field("config", &self.config)
            .field("random", &"<function>")
            .finish()
    }
}

/// Ring of counters covering a fixed window of time.
struct Lookback {
    bins: u64,
    width_nanos: u128,
    epoch: Instant,
    head: u64,
    total: u64,
    buf: Vec<u64>,
}

impl Lookback {
    fn new(window: Duration, bins: usize, epoch: Instant) -> Self {
        let bins = bins.max(1);
        let width_nanos = (window.as_nanos() / bins as u128).max(1);
        Self {
            bins: bins as u64,
            width_nanos,
            epoch,
            head: 0,
            total: 0,
            buf: vec![0; bins],
        }
    }

    fn add(&mut self, now: Instant, value: u64) {
        let pos = self.advance(now);
        if self.head.saturating_sub(pos) >= self.bins {
            return;
        }
        self.buf[(pos % self.bins) as usize] += value;
        self.total += value;
    }

    fn sum(&mut self, now: Instant) -> u64 {
        let pos = self.advance(now);
        if self.head.saturating_sub(pos) >= self.bins {
            return 0;
        }
        self.total
    }

    /// Moves the head to the bin containing `now`, clearing bins that fell
    /// out of the window. Returns the bin index for `now`.
    fn advance(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        let new_head = (elapsed / self.width_nanos) as u64;
        if new_head <= self.head {
            return new_head;
        }

        let steps = self.bins.min(new_head - self.head);
        for step in 0..steps {
            let index = ((self.head + step + 1) % self.bins) as usize;
            self.total -= self.buf[index];
            self.buf[index] = 0;
        }
        self.head = new_head;
        new_head
    }
}

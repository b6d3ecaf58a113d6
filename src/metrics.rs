//! Metrics recorded by the balancer.
//!
//! The balancer reports through an injected [`MetricsSink`]; nothing is
//! registered globally. [`RecorderMetrics`] forwards to whatever recorder is
//! installed for the `metrics` crate facade.

use crate::error::PickResultLabel;

/// Receiver for balancer metrics
pub trait MetricsSink: Send + Sync {
    /// Number of entries in the data cache
    fn record_cache_entries(&self, entries: u64);

    /// Bytes accounted in the data cache
    fn record_cache_size(&self, bytes: u64);

    /// A pick delegated to the default target
    fn record_default_target_pick(&self, target: &str, result: PickResultLabel);

    /// A pick delegated to a target returned by the lookup server
    fn record_target_pick(&self, target: &str, result: PickResultLabel);

    /// A pick failed without reaching any child policy
    fn record_failed_pick(&self);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_cache_entries(&self, _entries: u64) {}
    fn record_cache_size(&self, _bytes: u64) {}
    fn record_default_target_pick(&self, _target: &str, _result: PickResultLabel) {}
    fn record_target_pick(&self, _target: &str, _result: PickResultLabel) {}
    fn record_failed_pick(&self) {}
}

/// Reports through the `metrics` crate macros, labelled with the channel target
#[derive(Debug, Clone)]
pub struct RecorderMetrics {
    channel_target: String,
    lookup_service: String,
}

impl RecorderMetrics {
    pub fn new<T: Into<String>, S: Into<String>>(channel_target: T, lookup_service: S) -> Self {
        Self {
            channel_target: channel_target.into(),
            lookup_service: lookup_service.into(),
        }
    }

    fn labels(&self) -> [(&'static str, String); 2] {
        [
            ("channel_target", self.channel_target.clone()),
            ("lookup_service", self.lookup_service.clone()),
        ]
    }

    fn pick_labels(&self, target: &str, result: PickResultLabel) -> [(&'static str, String); 4] {
        [
            ("channel_target", self.channel_target.clone()),
            ("lookup_service", self.lookup_service.clone()),
            ("target", target.to_string()),
            ("result", result.to_string()),
        ]
    }
}

impl MetricsSink for RecorderMetrics {
    fn record_cache_entries(&self, entries: u64) {
        metrics::gauge!("rls_cache_entries", &self.labels()).set(entries as f64);
    }

    fn record_cache_size(&self, bytes: u64) {
        metrics::gauge!("rls_cache_size_bytes", &self.labels()).set(bytes as f64);
    }

    fn record_default_target_pick(&self, target: &str, result: PickResultLabel) {
        metrics::counter!(
            "rls_default_target_picks_total",
            &self.pick_labels(target, result)
        )
        .increment(1);
    }

    fn record_target_pick(&self, target: &str, result: PickResultLabel) {
        metrics::counter!("rls_target_picks_total", &self.pick_labels(target, result))
            .increment(1);
    }

    fn record_failed_pick(&self) {
        metrics::counter!("rls_failed_picks_total", &self.labels()).increment(1);
    }
}

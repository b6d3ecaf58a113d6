use crate::balancer::ConnectivityState;

/// What the monitor should do after a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Continue,
    /// The connection recovered from TRANSIENT_FAILURE
    BackToReady,
    Stop,
}

/// Detects READY after TRANSIENT_FAILURE.
///
/// Nothing is reported until the connection has been READY once; after
/// that, every READY preceded by TRANSIENT_FAILURE since the previous READY
/// is reported exactly once.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityTracker {
    seen_ready: bool,
    failed_since_ready: bool,
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, state: ConnectivityState) -> MonitorAction {
        match state {
            ConnectivityState::Shutdown => MonitorAction::Stop,
            ConnectivityState::Ready if !self.seen_ready => {
                self.seen_ready = true;
                self.failed_since_ready = false;
                MonitorAction::Continue
            }
            ConnectivityState::Ready if self.failed_since_ready => {
                self.failed_since_ready = false;
                MonitorAction::BackToReady
            }
            ConnectivityState::TransientFailure if self.seen_ready => {
                self.failed_since_ready = true;
                MonitorAction::Continue
            }
            _ => MonitorAction::Continue,
        }
    }
}

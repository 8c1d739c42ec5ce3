//! Keep-alive watchdog for an open log stream
//!
//! Tracks the last time data or a keep-alive marker arrived. The session
//! checks it once per read cycle and drops the stream when it has been
//! silent for longer than the timeout.

use std::time::Duration;
use tokio::time::Instant;

/// Silence allowed on an open stream before it is considered dead
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Watchdog state for one stream
#[derive(Debug, Clone)]
pub struct KeepAlive {
    last_activity: Option<Instant>,
    timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new(KEEPALIVE_TIMEOUT)
    }
}

impl KeepAlive {
    /// Create a disarmed watchdog
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_activity: None,
            timeout,
        }
    }

    /// Record activity (data or keep-alive received); arms the watchdog
    pub fn record_activity(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Disarm until the next activity
    pub fn clear(&mut self) {
        self.last_activity = None;
    }

    pub fn is_armed(&self) -> bool {
        self.last_activity.is_some()
    }

    /// Time since last activity; zero when disarmed
    pub fn idle(&self) -> Duration {
        self.last_activity
            .map(|at| Instant::now().saturating_duration_since(at))
            .unwrap_or_default()
    }

    /// True when armed and silent for longer than the timeout
    pub fn expired(&self) -> bool {
        self.is_armed() && self.idle() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

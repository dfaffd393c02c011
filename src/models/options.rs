//! Tuning options for the command queue and stream reconnection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options for a room's outgoing command queue.
///
/// # Example
///
/// ```rust
/// use banter_link::QueueOptions;
///
/// let options = QueueOptions::default()
///     .with_min_interval(std::time::Duration::from_millis(500))
///     .with_max_attempts(5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Minimum interval between request starts for one room.
    /// Raised (up to `max_min_interval`) whenever the platform signals
    /// "too many requests".
    #[serde(default = "default_min_interval")]
    pub min_interval: Duration,

    /// Ceiling for the adaptive minimum interval.
    #[serde(default = "default_max_min_interval")]
    pub max_min_interval: Duration,

    /// Maximum attempts per command, counting the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: Duration,

    /// Ceiling for retry backoff delays.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: Duration,

    /// Wait applied to a rate-limit response that does not name a delay.
    #[serde(default = "default_rate_limit_fallback")]
    pub rate_limit_fallback: Duration,

    /// When `true` (default) a command that is already executing when the
    /// room is left runs to its terminal result; when `false` it is
    /// cancelled. Commands that never started are always cancelled.
    #[serde(default = "default_drain_on_close")]
    pub drain_on_close: bool,
}

fn default_min_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_min_interval() -> Duration {
    Duration::from_secs(16)
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit_fallback() -> Duration {
    Duration::from_secs(2)
}

fn default_drain_on_close() -> bool {
    true
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            max_min_interval: default_max_min_interval(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            rate_limit_fallback: default_rate_limit_fallback(),
            drain_on_close: default_drain_on_close(),
        }
    }
}

impl QueueOptions {
    /// Set the minimum interval between request starts.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set the maximum attempts per command.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay for exponential retry backoff.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set whether an in-flight command is awaited or cancelled on leave.
    pub fn with_drain_on_close(mut self, drain: bool) -> Self {
        self.drain_on_close = drain;
        self
    }
}

/// Options for stream reconnection after a socket failure.
///
/// # Example
///
/// ```rust
/// use banter_link::ReconnectOptions;
///
/// let options = ReconnectOptions::default().with_max_attempts(3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectOptions {
    /// Initial delay before the first reconnection attempt.
    #[serde(default = "default_reconnect_delay")]
    pub initial_delay: Duration,

    /// Ceiling for the exponential reconnection backoff.
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay: Duration,

    /// Consecutive failed attempts before the room closes with
    /// [`ConnectionLost`](crate::BanterLinkError::ConnectionLost).
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_attempts() -> u32 {
    8
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: default_reconnect_delay(),
            max_delay: default_reconnect_max_delay(),
            max_attempts: default_reconnect_attempts(),
        }
    }
}

impl ReconnectOptions {
    /// Set the initial reconnection delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the bound on consecutive reconnection attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

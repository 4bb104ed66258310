//! Channel configuration.

use std::time::Duration;

use thiserror::Error;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("liveness timeout {timeout:?} must be shorter than interval {interval:?}")]
    LivenessOverlap { interval: Duration, timeout: Duration },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Liveness probing parameters.
///
/// The timeout is strictly shorter than the interval so a probe is always
/// judged before the next one goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Whether buses start a monitor on their own.
    pub enabled: bool,
    /// Time between probes.
    pub interval: Duration,
    /// Time a probe may stay unanswered.
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(58),
        }
    }
}

impl LivenessConfig {
    /// Enabled probing with the given interval and timeout.
    ///
    /// # Errors
    /// Returns error if either value is zero or the timeout is not shorter
    /// than the interval.
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Zero("liveness interval"));
        }
        if timeout.is_zero() {
            return Err(ConfigError::Zero("liveness timeout"));
        }
        if timeout >= interval {
            return Err(ConfigError::LivenessOverlap { interval, timeout });
        }
        Ok(Self {
            enabled: true,
            interval,
            timeout,
        })
    }
}

/// Reconnection backoff for endpoints that dial out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failures. None retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay following `current`, doubled and capped.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Per-connection and per-request settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long `connect` waits for the handshake to round-trip, and how long
    /// an accepted connection waits for the peer's handshake.
    pub handshake_timeout: Duration,
    /// Bound on every pending request. None waits forever.
    pub request_timeout: Option<Duration>,
    /// Liveness probing.
    pub liveness: LivenessConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: None,
            liveness: LivenessConfig::default(),
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }
}

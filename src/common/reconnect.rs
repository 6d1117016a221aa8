//! Reconnection pacing for chat sessions.
//!
//! A dropped transport is re-dialed immediately. Only consecutive failed dials
//! are spaced out with exponential backoff; attempts are never capped.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Configuration for exponential backoff between failed dials.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed dial.
    pub initial_delay: Duration,
    /// Maximum delay between dial attempts.
    pub max_delay: Duration,
    /// Multiplier for each successive failure.
    pub factor: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_jitter()
            .without_max_times()
            .build()
    }
}

/// Tracks consecutive dial failures and yields the wait before the next dial.
pub struct ReconnectState {
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Delay to wait before the next dial. The first dial after a drop is immediate.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            Duration::ZERO
        } else {
            self.backoff.next().unwrap_or(self.config.max_delay)
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset state after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff = self.config.backoff();
    }

    /// Number of dials attempted since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

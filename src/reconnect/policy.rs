//! Exponential backoff with a retry ceiling for feed reconnection

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt in milliseconds
    pub base_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// Upper bound on any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_attempts: 5,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

/// Reconnection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPhase {
    Idle,
    Scheduled,
    Attempting,
    Exhausted,
}

/// Snapshot of the reconnection state
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionState {
    pub attempt: u32,
    pub next_delay_ms: Option<u64>,
    pub max_attempts: u32,
    pub phase: ReconnectPhase,
}

/// Computes backoff delays and enforces the retry ceiling.
///
/// Attempts are numbered from 1; once the counter passes `max_attempts` the
/// policy is exhausted and schedules nothing until [`reset`](Self::reset).
pub struct ReconnectionPolicy {
    config: BackoffConfig,
    attempt: u32,
    next_delay: Option<Duration>,
    phase: ReconnectPhase,
}

impl ReconnectionPolicy {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            next_delay: None,
            phase: ReconnectPhase::Idle,
        }
    }

    /// Delay for a given attempt: `base * multiplier^(attempt - 1)`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(1.0) as u64
        } else {
            capped_delay.max(0.0) as u64
        };

        Duration::from_millis(final_delay)
    }

    /// Record a failure and schedule the next attempt.
    ///
    /// Returns `None` once the ceiling is passed.
    pub fn schedule(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);

        if self.attempt > self.config.max_attempts {
            self.phase = ReconnectPhase::Exhausted;
            self.next_delay = None;
            return None;
        }

        let delay = self.next_delay(self.attempt);
        self.phase = ReconnectPhase::Scheduled;
        self.next_delay = Some(delay);
        Some(delay)
    }

    /// Mark the scheduled attempt as started
    pub fn begin_attempt(&mut self) {
        if self.phase == ReconnectPhase::Scheduled {
            self.phase = ReconnectPhase::Attempting;
        }
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = None;
        self.phase = ReconnectPhase::Idle;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase == ReconnectPhase::Exhausted
    }

    pub fn state(&self) -> ReconnectionState {
        ReconnectionState {
            attempt: self.attempt,
            next_delay_ms: self.next_delay.map(|d| d.as_millis() as u64),
            max_attempts: self.config.max_attempts,
            phase: self.phase,
        }
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

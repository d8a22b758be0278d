//! Retry and reconnection policies.

use crate::config::RecoveryConfig;
use crate::error::DaqError;
use crate::pipeline::stop::StopSignal;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many times to retry and how long to wait between attempts.
///
/// # Example
///
/// ```rust
/// use imu_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.delay_for(3), Duration::from_millis(200));
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, _attempt: u32) -> Duration {
        self.backoff_delay
    }
}

/// Exponential backoff for reopening a link.
///
/// Delay after failed attempt `n` (1-based) is `initial_delay · multiplier^(n-1)`,
/// capped at `max_delay`. `max_attempts == None` retries until stopped.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Time allowed for the first valid frame after a reopen
    pub probe_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: (config.max_attempts > 0).then_some(config.max_attempts),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.backoff_multiplier,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether attempt `attempt` (1-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// An operation that can recover from a transient failure.
#[async_trait]
pub trait Recoverable<E> {
    async fn recover(&mut self) -> Result<(), E>;

    /// Label used in diagnostics.
    fn describe(&self) -> String {
        "link".to_string()
    }
}

/// How [`handle_recoverable_error`] ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered { attempts: u32 },
    /// A stop was requested while retrying.
    Stopped,
}

/// Retry `recoverable` until it succeeds, the policy bound runs out, or a stop
/// is requested.
///
/// The first attempt runs immediately. Non-retryable errors end the loop.
pub async fn handle_recoverable_error<T: Recoverable<DaqError> + Send>(
    recoverable: &mut T,
    policy: &ReconnectPolicy,
    stop: &StopSignal,
) -> Result<RecoveryOutcome, DaqError> {
    let target = recoverable.describe();
    let mut attempt = 1u32;
    loop {
        if stop.is_stopped() {
            return Ok(RecoveryOutcome::Stopped);
        }
        if !policy.allows(attempt) {
            warn!(target = %target, attempts = attempt - 1, "Reconnection attempts exhausted");
            return Err(DaqError::ReconnectExhausted(attempt - 1));
        }

        let result = tokio::select! {
            biased;
            _ = stop.stopped() => return Ok(RecoveryOutcome::Stopped),
            result = recoverable.recover() => result,
        };
        match result {
            Ok(()) => {
                info!(target = %target, attempts = attempt, "Link recovered");
                return Ok(RecoveryOutcome::Recovered { attempts: attempt });
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(attempt);
                if attempt == 1 || attempt.is_power_of_two() {
                    warn!(target = %target, attempt, error = %e, retry_in = ?delay, "Reconnection attempt failed");
                } else {
                    debug!(target = %target, attempt, error = %e, retry_in = ?delay, "Reconnection attempt failed");
                }
                tokio::select! {
                    biased;
                    _ = stop.stopped() => return Ok(RecoveryOutcome::Stopped),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

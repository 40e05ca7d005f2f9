//! Retry and circuit breaking for calls that leave the process.
//!
//! A [`Backoff`] wraps one external boundary (an oracle, the persistence
//! backend, the live swap backend). After `failure_threshold` consecutive
//! failures the circuit opens and calls are skipped until `cooldown` has
//! elapsed; the next call after that is a trial that either closes the
//! circuit or re-opens it.
//!
//! # Example
//!
//! ```
//! use tradegate_core::backoff::Backoff;
//! use tradegate_core::config::BackoffConfig;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backoff = Backoff::new("oracle", BackoffConfig::default().with_retries(2, 1));
//!
//! let value = backoff
//!     .retry(|| async { Ok::<_, std::io::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! assert!(!backoff.is_open());
//! # }
//! ```

use crate::config::BackoffConfig;
use parking_lot::RwLock;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackoffError {
    /// Too many consecutive failures; the boundary is cooling down.
    #[error("Circuit '{name}' open, {remaining_ms}ms remaining")]
    CircuitOpen {
        /// Boundary name.
        name: String,
        /// Time left before a trial call is allowed.
        remaining_ms: u64,
    },

    /// Every attempt failed.
    #[error("'{name}' failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        /// Boundary name.
        name: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Display form of the final error.
        last_error: String,
    },
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            total_failures: 0,
            total_successes: 0,
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

pub struct Backoff {
    name: String,
    config: BackoffConfig,
    state: RwLock<BackoffState>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Backoff")
            .field("name", &self.name)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("is_open", &state.opened_at.is_some())
            .finish_non_exhaustive()
    }
}

impl Backoff {
    #[must_use]
    pub fn new(name: impl Into<String>, config: BackoffConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BackoffState::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Checks whether a call may proceed.
    ///
    /// # Errors
    ///
    /// Returns `BackoffError::CircuitOpen` while the cooldown is running.
    pub fn can_call(&self) -> Result<(), BackoffError> {
        let mut state = self.state.write();
        let Some(opened_at) = state.opened_at else {
            return Ok(());
        };

        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        let elapsed = opened_at.elapsed();
        if elapsed >= cooldown {
            // Half-open: allow one trial, a failure re-opens immediately.
            state.opened_at = None;
            state.consecutive_failures = self.config.failure_threshold.saturating_sub(1);
            debug!(boundary = %self.name, "Circuit cooldown elapsed, allowing trial call");
            return Ok(());
        }

        let remaining = cooldown - elapsed;
        Err(BackoffError::CircuitOpen {
            name: self.name.clone(),
            remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.total_successes += 1;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write();
        state.consecutive_failures += 1;
        state.total_failures += 1;

        if state.opened_at.is_none() && state.consecutive_failures >= self.config.failure_threshold {
            state.opened_at = Some(Instant::now());
            warn!(
                boundary = %self.name,
                failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "Circuit opened"
            );
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().opened_at.is_some()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    /// Lifetime (successes, failures).
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.total_successes, state.total_failures)
    }

    pub fn reset(&self) {
        *self.state.write() = BackoffState::new();
    }

    /// Exponential delay before retry `attempt` (0-based), capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self.config.base_delay_ms.saturating_mul(factor).min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Runs `op` up to `max_retries + 1` times with exponential delay between attempts.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` if the circuit is (or becomes) open, or `Exhausted`
    /// once every attempt has failed.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, BackoffError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            self.can_call()?;

            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure();
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(BackoffError::Exhausted {
                            name: self.name.clone(),
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    debug!(
                        boundary = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Runs a single attempt of `fut` bounded by `timeout`. A timeout counts as a failure.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` without polling `fut` while the circuit is open,
    /// or `Exhausted` if the attempt errors or times out.
    pub async fn call<T, E, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T, BackoffError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.can_call()?;

        let last_error = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                return Ok(value);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        self.record_failure();
        Err(BackoffError::Exhausted {
            name: self.name.clone(),
            attempts: 1,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> BackoffConfig {
        BackoffConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_millis(50))
            .with_retries(2, 1)
    }

    #[test]
    fn test_opens_after_threshold() {
        let backoff = Backoff::new("test", fast_config());

        backoff.record_failure();
        backoff.record_failure();
        assert!(backoff.can_call().is_ok());

        backoff.record_failure();
        assert!(backoff.is_open());
        assert!(matches!(backoff.can_call(), Err(BackoffError::CircuitOpen { .. })));
    }

    #[test]
    fn test_success_resets_failures() {
        let backoff = Backoff::new("test", fast_config());
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_success();

        assert_eq!(backoff.consecutive_failures(), 0);
        assert_eq!(backoff.totals(), (1, 2));
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let config = BackoffConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..Default::default()
        };
        let backoff = Backoff::new("test", config);

        assert_eq!(backoff.delay_for(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(40));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(50));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cooldown_allows_trial_call() {
        let backoff = Backoff::new("test", fast_config());
        for _ in 0..3 {
            backoff.record_failure();
        }
        assert!(backoff.can_call().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backoff.can_call().is_ok());

        // A single failure in half-open state re-opens the circuit.
        backoff.record_failure();
        assert!(backoff.is_open());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let backoff = Backoff::new("test", fast_config().with_failure_threshold(10));
        let calls = AtomicU32::new(0);

        let result = backoff
            .retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(backoff.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let backoff = Backoff::new("test", fast_config().with_failure_threshold(10));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = backoff
            .retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("disk full") }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(BackoffError::Exhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "disk full");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let backoff = Backoff::new("test", fast_config());

        let result: Result<(), BackoffError> = backoff
            .call(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(BackoffError::Exhausted { .. })));
        assert_eq!(backoff.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_call() {
        let backoff = Backoff::new("test", fast_config());
        for _ in 0..3 {
            backoff.record_failure();
        }

        let polled = AtomicU32::new(0);
        let result = backoff
            .call(Duration::from_millis(10), async {
                polled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(BackoffError::CircuitOpen { .. })));
        assert_eq!(polled.load(Ordering::SeqCst), 0);
    }
}

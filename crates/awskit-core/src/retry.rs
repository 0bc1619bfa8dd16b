//! Backoff policy and per-call retry bookkeeping.

use crate::error::{ErrorKind, ToolkitError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How delays are drawn from the backoff ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Uniform in `[0, ceiling]` ("full jitter").
    #[default]
    Standard,
    /// Exactly the ceiling; deterministic.
    Fixed,
}

/// Limits applied to one request, every page included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Calls allowed per request, first attempt included.
    pub max_attempts: u32,
    /// Budget for the sum of all backoff sleeps.
    pub max_total_backoff: Duration,
    /// Base delay for server faults and transport errors.
    pub initial_backoff: Duration,
    /// Cap for a single delay.
    pub max_backoff: Duration,
    /// Base delay after a throttling response.
    pub throttle_backoff: Duration,
    pub mode: RetryMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_total_backoff: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(20),
            throttle_backoff: Duration::from_millis(500),
            mode: RetryMode::Standard,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Upper bound of the delay for the `exponent`-th failure of a window.
    pub fn ceiling(&self, base: Duration, exponent: u32) -> Duration {
        let factor = 2u32.saturating_pow(exponent.min(31));
        base.saturating_mul(factor).min(self.max_backoff)
    }

    fn draw(&self, ceiling: Duration) -> Duration {
        match self.mode {
            RetryMode::Fixed => ceiling,
            RetryMode::Standard => {
                let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        }
    }
}

/// Bookkeeping for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Calls made so far.
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub last_throttled: bool,
    pub next_delay: Option<Duration>,
    pub total_backoff: Duration,
    /// Attempt number that opened the current jitter window.
    pub window_start: u32,
    window_base: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Decide the delay before the next attempt after `err`.
    ///
    /// Returns `None` when the attempt cap is reached or the delay would push
    /// the total backoff past the budget. A throttling response opens a new
    /// window at the throttling base delay.
    pub fn schedule(&mut self, policy: &RetryPolicy, err: &ToolkitError) -> Option<Duration> {
        self.last_error = Some(err.kind);
        self.last_throttled = err.throttled;
        self.next_delay = None;

        if self.attempts >= policy.max_attempts {
            return None;
        }

        if err.throttled {
            self.window_start = self.attempts;
            self.window_base = policy.throttle_backoff;
        } else if self.window_start == 0 {
            self.window_start = self.attempts;
            self.window_base = policy.initial_backoff;
        }

        let exponent = self.attempts.saturating_sub(self.window_start);
        let delay = policy.draw(policy.ceiling(self.window_base, exponent));
        let total = self.total_backoff.saturating_add(delay);
        if total > policy.max_total_backoff {
            return None;
        }
        self.total_backoff = total;
        self.next_delay = Some(delay);
        Some(delay)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn wait_backoff(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), ToolkitError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ToolkitError::cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Run `attempt` until it succeeds, fails non-transiently, or the budget is spent.
///
/// Only `Transient` failures are retried. The closure receives the 1-based
/// attempt number.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    label: &str,
    mut attempt: F,
) -> Result<T, ToolkitError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ToolkitError>>,
{
    let mut state = RetryState::new();
    loop {
        if cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(ToolkitError::cancelled().with_attempts(state.attempts));
        }
        state.record_attempt();
        let err = match attempt(state.attempts).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.kind != ErrorKind::Transient {
            return Err(err.with_attempts(state.attempts));
        }
        match state.schedule(policy, &err) {
            Some(delay) => {
                log::warn!(
                    "{} attempt {} failed ({}), retrying in {:?}",
                    label,
                    state.attempts,
                    err.code,
                    delay
                );
                wait_backoff(delay, cancel)
                    .await
                    .map_err(|e| e.with_attempts(state.attempts))?;
            }
            None => {
                return Err(ToolkitError::retry_exhausted(err.with_attempts(state.attempts)));
            }
        }
    }
}

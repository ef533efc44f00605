//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::StageOutcome;

const BACKOFF_MAX_SHIFT: u32 = 16;

/// Retry parameters shared by the fetch and transform stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. 0 disables retries.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Should a failure on `attempt` be followed by another attempt?
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Drive `op` until it succeeds, is skipped, or the attempts run out.
    ///
    /// Only the last outcome is returned; its `attempts` field counts every
    /// attempt made.
    pub async fn run<F, Fut>(&self, label: &str, mut op: F) -> StageOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StageOutcome>,
    {
        let mut attempt = 1u32;
        loop {
            let mut outcome = op(attempt).await;
            outcome.attempts = attempt;

            if !outcome.is_failed() {
                return outcome;
            }
            if !self.should_retry(attempt) {
                warn!(
                    item = %label,
                    stage = %outcome.stage,
                    attempts = attempt,
                    "Retries exhausted"
                );
                return outcome;
            }

            let delay = self.backoff(attempt);
            debug!(
                item = %label,
                stage = %outcome.stage,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %outcome.diagnostic().map(|d| d.to_string()).unwrap_or_default(),
                "Stage failed, will retry"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

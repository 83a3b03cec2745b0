//! Retry executor for transient database failures.
//!
//! Runs a unit of work with exponential backoff. Only errors matching the
//! transient classifier are retried; the cancellation token is honored
//! before every attempt and during the backoff sleep.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Substrings that mark a driver error message as transient.
///
/// The list is deliberately closed: anything not matching fails fast.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection closed",
    "connection reset",
    "connection refused",
    "broken pipe",
    "timed out",
    "timeout",
    "network",
    "terminating connection",
    "the database system is starting up",
    "too many connections",
];

/// Whether an error message matches the transient classifier.
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lowered.contains(p))
}

/// Backoff parameters for [`run_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Reattempts after the first failure; 0 disables retry.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based failure count).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Run `op` with retry under `policy`.
///
/// `op` receives the attempt number (0-based) and must perform its own
/// connection acquisition, so every retry starts from a fresh handle.
/// `on_retry(attempt, error)` fires before each backoff sleep; callers
/// use it to invalidate cached state before the reacquisition.
///
/// Cancellation wins over retry: the token is checked before each attempt
/// and races the backoff sleep.
pub async fn run_with_retry<'a, T, F, H>(
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    mut on_retry: H,
    mut op: F,
) -> Result<T, EngineError>
where
    F: AsyncFnMut(u32) -> Result<T, EngineError>,
    H: FnMut(u32, &EngineError),
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, will retry"
                );
                on_retry(attempt + 1, &err);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
                attempt += 1;
            }
            Err(err) => {
                if attempt > 0 {
                    tracing::error!(
                        attempts = attempt + 1,
                        error = %err,
                        "operation failed after retries"
                    );
                }
                return Err(err);
            }
        }
    }
}

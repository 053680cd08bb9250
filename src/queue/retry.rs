use std::time::Duration;

use rand::Rng;

use crate::queue::error::HandlerError;
use crate::queue::task::Task;

/// Error fragments that make a handler failure terminal. Matching is
/// case-insensitive substring search over the error message.
const NON_RETRYABLE_PATTERNS: [&str; 4] = [
    "invalid",
    "not found",
    "permission denied",
    "validation failed",
];

/// Decides whether a failed task gets another attempt and how long to wait.
///
/// Backoff is `base · 2^(attempts-1)` capped at sixteen times the base, then
/// perturbed by ±25% uniform jitter. With the 5-second default base the
/// delays land near 5, 10, 20, 40 and 80 seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: base_delay * 16,
        }
    }

    /// `(retry?, delay)` for the task's current attempt count and error.
    pub fn should_retry(&self, task: &Task, error: &HandlerError) -> (bool, Duration) {
        self.should_retry_with(task, error, &mut rand::thread_rng())
    }

    /// Same decision with a caller-supplied randomness source, so tests can
    /// pin the jitter.
    pub fn should_retry_with<R: Rng>(
        &self,
        task: &Task,
        error: &HandlerError,
        rng: &mut R,
    ) -> (bool, Duration) {
        if task.attempts >= task.max_retries {
            return (false, Duration::ZERO);
        }
        if !is_retryable(error.message()) {
            return (false, Duration::ZERO);
        }
        (true, self.backoff(task.attempts, rng))
    }

    fn backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return self.base_delay;
        }
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(30));
        let capped = exp.min(self.max_delay);
        capped.mul_f64(1.0 + rng.gen_range(-0.25..=0.25))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    !NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

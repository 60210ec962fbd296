//! Backoff helper for caller-driven retry policies
//!
//! The framework never retries on its own: a failed remote call is the
//! calling component's signal to reconfigure and try again. This module is
//! the mechanism such callers reach for: a bounded attempt loop with
//! configurable backoff, retrying only errors the taxonomy marks transient.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{SpindleError, SpindleResult};

/// Delay progression between attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential increase (base * multiplier^attempt), capped at max
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-based: the delay after the first
    /// failure is `delay(1)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(duration) => *duration,
            BackoffPolicy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(attempt.saturating_sub(1) as f64);
                let millis = (base.as_millis() as f64 * factor) as u64;
                std::cmp::min(Duration::from_millis(millis), *max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(50),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Attempt budget plus backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffPolicy::Fixed(delay),
        }
    }
}

/// Run an operation with the policy, retrying transient failures only.
///
/// The operation receives the 1-based attempt number, so a caller
/// implementing the reconfigure-and-retry protocol can reconfigure before
/// every attempt after the first.
pub fn retry_with_backoff<T, F>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> SpindleResult<T>
where
    F: FnMut(u32) -> SpindleResult<T>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> SpindleError {
        SpindleError::RemoteInvocation {
            operation: "serve".to_string(),
            details: "connection reset".to_string(),
        }
    }

    #[test]
    fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result = retry_with_backoff(&policy, "serve", |_attempt| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: SpindleResult<()> = retry_with_backoff(&policy, "build", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SpindleError::UnknownComponent {
                name: "ghost".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let result: SpindleResult<()> = retry_with_backoff(&policy, "serve", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        });
        assert!(matches!(
            result.unwrap_err(),
            SpindleError::RemoteInvocation { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(250),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(250));
    }
}

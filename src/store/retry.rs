//! Bounded retry with linear backoff for store operations.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::schema::RetryConfig;

/// Errors that may succeed when the same operation is attempted again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for rusqlite::Error {
    fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode;
        matches!(
            self.sqlite_error_code(),
            Some(
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
            )
        )
    }
}

/// Result of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was not transient; no further attempts were made.
    Permanent(E),
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
}

/// Retry budget with linearly increasing backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `attempt + 1` (`attempt` is 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` must be self-contained: every attempt re-enters the same
    /// transaction boundary.
    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: Transient + Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryFailure::Permanent(err)),
                Err(err) if attempt >= self.max_attempts => {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed on attempt {}/{}: {}; retrying in {:?}",
                        operation, attempt, self.max_attempts, err, delay
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct FakeError {
        transient: bool,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake (transient: {})", self.transient)
        }
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let calls = Cell::new(0);
        let result = policy.run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(FakeError { transient: true })
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhausts_budget() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("op", || {
            calls.set(calls.get() + 1);
            Err(FakeError { transient: true })
        });
        assert!(matches!(
            result,
            Err(RetryFailure::Exhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("op", || {
            calls.set(calls.get() + 1);
            Err(FakeError { transient: false })
        });
        assert!(matches!(result, Err(RetryFailure::Permanent(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(50, Duration::from_millis(1000));
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(3000));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }
}

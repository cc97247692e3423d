//! Bounded retry with linear backoff
//!
//! Both the range store and the data store retry failed calls the same way:
//! up to `max_attempts` tries, sleeping `attempt * step` after each failure.

use std::thread;
use std::time::Duration;
use tracing::warn;

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Backoff unit; the delay after attempt N is `N * step`
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps (tests)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            step: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step * attempt
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or runs
    /// out of attempts. `before_retry` runs between attempts after the sleep
    /// (reconnecting a client, for example).
    pub fn run<T, E, F, P, R>(
        &self,
        what: &str,
        mut op: F,
        retryable: P,
        mut before_retry: R,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        R: FnMut(),
    {
        self.run_with(what, &mut (), |_| op(), retryable, |_| before_retry())
    }

    /// Like [`RetryPolicy::run`], with both the operation and the retry hook
    /// borrowing the same state (a data-store client)
    pub fn run_with<S, T, E, F, P, R>(
        &self,
        what: &str,
        state: &mut S,
        mut op: F,
        retryable: P,
        mut before_retry: R,
    ) -> Result<T, E>
    where
        S: ?Sized,
        E: std::fmt::Display,
        F: FnMut(&mut S) -> Result<T, E>,
        P: Fn(&E) -> bool,
        R: FnMut(&mut S),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(state) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Retrying after error"
                    );
                    thread::sleep(self.delay_for(attempt));
                    before_retry(state);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
    }

    #[test]
    fn test_succeeds_after_retries() {
        let policy = RetryPolicy::immediate(5);
        let calls = Cell::new(0);
        let reconnects = Cell::new(0);

        let result: Result<u32, String> = policy.run(
            "op",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("timeout".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
            || reconnects.set(reconnects.get() + 1),
        );

        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
        assert_eq!(reconnects.get(), 2);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::immediate(5);
        let calls = Cell::new(0);

        let result: Result<(), String> = policy.run(
            "op",
            || {
                calls.set(calls.get() + 1);
                Err("timeout".to_string())
            },
            |_| true,
            || {},
        );

        assert!(result.is_err());
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let policy = RetryPolicy::immediate(5);
        let calls = Cell::new(0);

        let result: Result<(), String> = policy.run(
            "op",
            || {
                calls.set(calls.get() + 1);
                Err("fatal".to_string())
            },
            |e| e != "fatal",
            || {},
        );

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_run_with_shared_state() {
        let policy = RetryPolicy::immediate(3);
        let mut attempts = Vec::new();

        let result: Result<usize, String> = policy.run_with(
            "op",
            &mut attempts,
            |log| {
                log.push("try");
                if log.len() < 3 {
                    Err("timeout".to_string())
                } else {
                    Ok(log.len())
                }
            },
            |_| true,
            |log| log.push("reconnect"),
        );

        assert_eq!(result, Ok(3));
        assert_eq!(attempts, vec!["try", "reconnect", "try"]);
    }
}

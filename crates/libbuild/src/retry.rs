//! Retry loop for operations that fail with transient errors.
use std::time::Duration;

use crate::cancel::{CancelToken, Cancelled};

pub const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Classifies an error as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Runs `op` until it succeeds, fails with a non retryable error, or has been
/// retried [`MAX_RETRIES`] times. The delay doubles after every attempt.
pub fn with_retry<T, E, F>(cancel: &CancelToken, what: &str, op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display + From<Cancelled>,
    F: FnMut() -> Result<T, E>,
{
    with_backoff(cancel, what, INITIAL_BACKOFF, op)
}

pub(crate) fn with_backoff<T, E, F>(
    cancel: &CancelToken,
    what: &str,
    initial: Duration,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display + From<Cancelled>,
    F: FnMut() -> Result<T, E>,
{
    let mut delay = initial;
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::warn!("{what} failed ({err}), retrying in {delay:?} ({attempt}/{MAX_RETRIES})");
                cancel.sleep(delay)?;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("fatal")]
        Fatal,
        #[error(transparent)]
        Cancelled(#[from] Cancelled),
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    const FAST: Duration = Duration::from_millis(1);

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = with_backoff(&CancelToken::new(), "fetch", FAST, || {
            calls += 1;
            if calls < 3 {
                Err(TestError::Flaky)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(&CancelToken::new(), "fetch", FAST, || {
            calls += 1;
            Err(TestError::Flaky)
        });
        assert!(matches!(result, Err(TestError::Flaky)));
        assert_eq!(calls, MAX_RETRIES + 1);
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(&CancelToken::new(), "fetch", FAST, || {
            calls += 1;
            Err(TestError::Fatal)
        });
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let token = CancelToken::new();
        token.cancel();
        let result: Result<(), TestError> = with_backoff(&token, "fetch", FAST, || Ok(()));
        assert!(matches!(result, Err(TestError::Cancelled(_))));
    }
}

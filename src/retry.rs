//! Bounded retry with exponential backoff around blocking I/O.

use std::thread;

use log::warn;

use crate::error::{PulseError, Result};
use crate::options::RetryOptions;

/// Last error of an operation that failed on every attempt.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: usize,
    pub last: PulseError,
}

/// Runs `op` until it succeeds or `options.max_attempts` attempts have failed.
///
/// The closure receives the zero-based attempt number. Between attempts the
/// thread sleeps for [`RetryOptions::backoff_after`]. Errors that are not
/// [retryable](PulseError::is_retryable) end the loop at once.
pub fn with_retry<T, F>(
    options: &RetryOptions,
    what: &str,
    mut op: F,
) -> std::result::Result<T, Exhausted>
where
    F: FnMut(usize) -> Result<T>,
{
    let attempts = options.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = options.backoff_after(attempt);
                warn!(
                    "{what}: attempt {} of {attempts} failed ({err}), retrying in {delay:?}",
                    attempt + 1
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(last) => {
                return Err(Exhausted {
                    attempts: attempt + 1,
                    last,
                })
            }
        }
    }
}

/// [`with_retry`] for reads of raw input; exhaustion becomes [`PulseError::Fetch`].
pub fn fetch_with_retry<T, F>(options: &RetryOptions, what: impl Into<String>, op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let what = what.into();
    with_retry(options, &what, op).map_err(|exhausted| PulseError::Fetch {
        what,
        attempts: exhausted.attempts,
        reason: exhausted.last.to_string(),
    })
}

/// [`with_retry`] for table writes; exhaustion becomes [`PulseError::SinkWrite`].
pub fn write_with_retry<T, F>(options: &RetryOptions, table: &'static str, op: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    with_retry(options, table, op).map_err(|exhausted| PulseError::SinkWrite {
        table,
        attempts: exhausted.attempts,
        reason: exhausted.last.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;

    fn quick(attempts: usize) -> RetryOptions {
        RetryOptions::default()
            .with_max_attempts(attempts)
            .with_initial_backoff(Duration::ZERO)
    }

    fn flaky(err: &str) -> PulseError {
        PulseError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }

    #[test]
    fn succeeds_once_the_operation_recovers() {
        let mut calls = 0;
        let value = with_retry(&quick(3), "flaky", |attempt| {
            calls += 1;
            if attempt < 2 {
                Err(flaky("not yet"))
            } else {
                Ok(attempt)
            }
        })
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhaustion_is_a_sink_write_error() {
        let mut calls = 0;
        let result: Result<()> = write_with_retry(&quick(2), "crosstab", |_| {
            calls += 1;
            Err(flaky("disk full"))
        });
        assert_eq!(calls, 2);
        match result {
            Err(PulseError::SinkWrite {
                table, attempts, ..
            }) => {
                assert_eq!(table, "crosstab");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let result: Result<()> = fetch_with_retry(&quick(0), "week 3", |_| Err(flaky("gone")));
        assert!(matches!(result, Err(PulseError::Fetch { attempts: 1, .. })));
    }

    #[test]
    fn missing_input_fails_without_retrying() {
        let mut calls = 0;
        let result: Result<()> = fetch_with_retry(&quick(3), "week 9", |_| {
            calls += 1;
            Err(PulseError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "pulse2020_puf_09.csv",
            )))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(PulseError::Fetch { attempts: 1, .. })));
    }

    #[test]
    fn backoff_grows_geometrically() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff_after(0), Duration::from_millis(200));
        assert_eq!(options.backoff_after(2), Duration::from_millis(800));
    }
}

//! # Summary
//!
//! Conflict retry for read-modify-append cycles. Only `ConcurrencyConflict`
//! is retried: the operation is expected to reload its aggregate on every
//! attempt, so a retry observes whatever the competing writer appended.

use std::time;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    /// Retries after the first attempt
    retries: usize,

    /// Base wait, grown linearly per attempt and jittered
    wait: time::Duration,
}

impl Backoff {
    pub fn new(retries: usize, wait: time::Duration) -> Self {
        Backoff { retries, wait }
    }

    /// Runs `operation` until it succeeds, fails with anything other than a
    /// conflict, or runs out of retries.
    pub fn retry<T, F>(&self, mut operation: F) -> Result<T>
        where F: FnMut(usize) -> Result<T>
    {
        let mut attempt = 0;
        loop {
            match operation(attempt) {
            | Err(Error::ConcurrencyConflict { expected, actual }) if attempt < self.retries => {
                warn!(
                    "Conflict at version {} (log at {}), retry {} of {}",
                    expected, actual, attempt + 1, self.retries,
                );
                std::thread::sleep(self.delay(attempt));
                attempt += 1;
            }
            | result => return result,
            }
        }
    }

    fn delay(&self, attempt: usize) -> time::Duration {
        let jitter = 1.0 + rand::random::<f32>();
        self.wait.mul_f32(jitter * (attempt + 1) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> Error {
        Error::ConcurrencyConflict { expected: 1, actual: 2 }
    }

    #[test]
    fn conflicts_are_retried_until_success() {
        let backoff = Backoff::new(3, time::Duration::from_micros(1));
        let mut calls = 0;
        let result = backoff.retry(|attempt| {
            calls += 1;
            if attempt < 2 { Err(conflict()) } else { Ok(attempt) }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausted_retries_surface_the_conflict() {
        let backoff = Backoff::new(2, time::Duration::from_micros(1));
        let mut calls = 0;
        let result: Result<()> = backoff.retry(|_| {
            calls += 1;
            Err(conflict())
        });
        assert!(matches!(result, Err(Error::ConcurrencyConflict { .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let backoff = Backoff::new(5, time::Duration::from_micros(1));
        let mut calls = 0;
        let result: Result<()> = backoff.retry(|_| {
            calls += 1;
            Err(Error::NotResolved)
        });
        assert!(matches!(result, Err(Error::NotResolved)));
        assert_eq!(calls, 1);
    }
}

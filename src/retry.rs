//! Retry and backoff shared by every network operation.
//!
//! A failed attempt is retried only while attempts remain and the failure is
//! transient (see [`KiraError::is_transient`]). The delay before attempt `n + 1`
//! is `retry_delay * 1.5^n`.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::KiraError;
use crate::pool::CancelToken;

/// Multiplier applied to the base delay for each attempt.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry(&self, attempt: u32, error: &KiraError) -> bool {
        attempt < self.max_retries && error.is_transient()
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.retry_delay.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(exponent);
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis as u64)
    }

    /// Sleeps for the backoff of `attempt`, waking early when cancelled.
    pub fn backoff(&self, attempt: u32, cancel: &CancelToken) -> Result<(), KiraError> {
        let delay = self.backoff_delay(attempt);
        if delay.is_zero() {
            return cancel.check();
        }
        let deadline = Instant::now() + delay;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Runs `f(attempt, last_attempt)` until it succeeds, fails permanently, or the
    /// retries run out. Exhausted transient failures become
    /// [`KiraError::RetriesExhausted`].
    pub fn retry<T, F>(&self, what: &str, cancel: &CancelToken, mut f: F) -> Result<T, KiraError>
    where
        F: FnMut(u32, bool) -> Result<T, KiraError>,
    {
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            let last_attempt = attempt >= self.max_retries;
            match f(attempt, last_attempt) {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempt, &err) => {
                    warn!(
                        "{what} failed (attempt #{} of {}): {err}, retrying in {:?}",
                        attempt + 1,
                        self.max_retries + 1,
                        self.backoff_delay(attempt)
                    );
                    self.backoff(attempt, cancel)?;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    debug!("{what} failed on its last attempt: {err}");
                    return Err(KiraError::RetriesExhausted {
                        what: what.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

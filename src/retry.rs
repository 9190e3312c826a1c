//! Bounded retry with exponential backoff around usage collection.

use crate::error::TallyError;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use std::time::Duration;
use tracing::{event, Level};

/// How often, and how patiently, a failed collection is attempted again.
/// Passed explicitly into every run.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 2000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` attempts back to back.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Default::default()
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The last error is returned.
    pub fn execute<T, F>(&self, operation_name: &str, mut operation: F) -> Result<T, TallyError>
    where
        F: FnMut() -> Result<T, TallyError>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        let result = backoff::retry(policy, || {
            attempt += 1;
            operation().map_err(|err| {
                if !err.is_retryable() {
                    event!(
                        Level::WARN,
                        operation = operation_name,
                        error = %err,
                        "Operation failed with a non-retryable error."
                    );
                    backoff::Error::permanent(err)
                } else if attempt >= max_attempts {
                    event!(
                        Level::WARN,
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Operation failed after max attempts."
                    );
                    backoff::Error::permanent(err)
                } else {
                    event!(
                        Level::WARN,
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Operation failed, retrying after backoff."
                    );
                    backoff::Error::transient(err)
                }
            })
        });

        match result {
            Ok(value) => {
                if attempt > 1 {
                    event!(
                        Level::INFO,
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry."
                    );
                }
                Ok(value)
            }
            Err(backoff::Error::Permanent(err)) => Err(err),
            Err(backoff::Error::Transient { err, .. }) => Err(err),
        }
    }
}

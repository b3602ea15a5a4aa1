// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry with exponential backoff.
//!
//! Used when establishing the Redis connection manager and the SQL pool,
//! and for `ping`. Once connected, nothing in the counter cache retries on
//! its own: foreground callers see errors immediately and the scanner
//! waits for its next pass.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use counter_cache::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // Four waits between five attempts: 200ms, 400ms, 800ms, 1.6s
//! let waits: Vec<Duration> = startup.backoff().collect();
//! assert_eq!(waits.len(), 4);
//! assert_eq!(startup.total_wait(), Duration::from_millis(3_000));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Attempt limit and backoff schedule for connecting to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first; at least one is always made.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Connecting at startup: surface a bad URL or a dead server within seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Health checks on a live connection.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Waits between consecutive attempts, one fewer than `max_attempts`.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        let waits = self.max_attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |delay| {
            Some(delay.mul_f64(self.factor).min(self.max_delay))
        })
        .take(waits)
    }

    /// Worst-case time spent sleeping before giving up.
    pub fn total_wait(&self) -> Duration {
        self.backoff().sum()
    }
}

/// Run `connect` until it succeeds or every attempt has failed.
/// The last error is returned.
pub async fn retry<F, Fut, T, E>(target: &str, config: &RetryConfig, mut connect: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut waits = config.backoff();
    let mut attempt = 1u32;

    loop {
        let err = match connect().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(target_name = target, attempt, "Backend reachable after retries");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let Some(wait) = waits.next() else {
            warn!(target_name = target, attempts = attempt, error = %err, "Giving up on backend");
            return Err(err);
        };
        warn!(
            target_name = target,
            attempt,
            max_attempts = config.max_attempts,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Backend unreachable, retrying"
        );
        sleep(wait).await;
        attempt += 1;
    }
}

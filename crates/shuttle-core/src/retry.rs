//! Retry with backoff.

use std::future::{self, Future};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ShuttleError;

/// Retry policy.
///
/// Defaults: unlimited retries, 1s interval, multiplier 1 (constant delay),
/// no interval ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts. `None` retries until success.
    pub max_retries: Option<u32>,

    /// Delay after the first failed attempt.
    #[serde(rename = "interval_ms", with = "crate::config::millis")]
    pub interval: Duration,

    /// Factor applied to the delay after every attempt.
    pub interval_multiplier: f64,

    /// Ceiling for the delay. Does not clamp the initial `interval`.
    #[serde(rename = "max_interval_ms", with = "crate::config::millis_opt")]
    pub max_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            interval: Duration::from_secs(1),
            interval_multiplier: 1.0,
            max_interval: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.interval_multiplier = multiplier;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    pub fn validate(&self) -> Result<(), ShuttleError> {
        let m = self.interval_multiplier;
        if !m.is_finite() || m < 0.0 {
            return Err(ShuttleError::InvalidConfig(format!(
                "interval_multiplier must be a finite, non-negative number (got {m})"
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.interval,
            multiplier: self.interval_multiplier,
            ceiling: self.max_interval,
        }
    }
}

/// Delay sequence of a [`RetryPolicy`]: `next = min(current * multiplier, ceiling)`.
///
/// Never ends; the retry loop decides how many delays it takes.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    ceiling: Option<Duration>,
}

impl Backoff {
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and move to the next one.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        let scaled = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(Duration::MAX);
        self.current = match self.ceiling {
            Some(ceiling) => scaled.min(ceiling),
            None => scaled,
        };
        delay
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.advance())
    }
}

/// Call `task` until it succeeds or the policy's budget runs out.
///
/// An `Err` from `task` is a failed attempt. Individual causes are not kept;
/// use [`retry_with`] to observe them.
pub async fn retry<F, Fut, T, E>(task: F, policy: &RetryPolicy) -> Result<T, ShuttleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with(task, policy, |_, _| future::ready(())).await
}

/// Like [`retry`], awaiting `on_failed(cause, attempt)` after every failed
/// attempt (0-based) before the backoff delay.
///
/// No delay follows the last allowed attempt. `max_retries = Some(0)` fails
/// without calling `task`.
pub async fn retry_with<F, Fut, T, E, O, OFut>(
    mut task: F,
    policy: &RetryPolicy,
    mut on_failed: O,
) -> Result<T, ShuttleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&E, u32) -> OFut,
    OFut: Future<Output = ()>,
{
    policy.validate()?;

    let mut backoff = policy.backoff();
    let mut attempt: u32 = 0;
    while policy.max_retries.is_none_or(|max| attempt < max) {
        match task().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(cause) => {
                on_failed(&cause, attempt).await;

                let delay = backoff.advance();
                let last = policy
                    .max_retries
                    .is_some_and(|max| attempt.saturating_add(1) >= max);
                if !last {
                    debug!(attempt, ?delay, "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        attempt = attempt.saturating_add(1);
    }

    warn!(attempts = attempt, "retry budget exhausted");
    Err(ShuttleError::RetryExhausted { attempts: attempt })
}

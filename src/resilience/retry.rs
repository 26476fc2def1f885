//! Retry policy
//!
//! Decides whether a failed attempt is retried and how long to wait first.
//! The same policy type drives both the connection budget (inside
//! `ConnectionManager`) and the independent query budget (inside
//! `QueryProcessor`).

use crate::error_code::ErrorKind;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Serializable retry knobs, as they appear in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 30.0,
            backoff_multiplier: 2.0,
            retry_on: vec![ErrorKind::Timeout, ErrorKind::RateLimit, ErrorKind::Connection],
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retry_on: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: secs(s.base_delay_secs),
            max_delay: secs(s.max_delay_secs),
            backoff_multiplier: s.backoff_multiplier,
            retry_on: s.retry_on.iter().copied().collect(),
        }
    }
}

fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    /// Replace the whitelist of retryable kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Exponential backoff: `min(base_delay * multiplier^attempt, max_delay)`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 {
            return self.max_delay;
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(d) => d.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    /// `attempt` is 0-based (first failure => attempt=0).
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        self.retry_on.contains(&error.kind())
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// A backend-supplied `retry_after` wins over the computed backoff but is
    /// still capped by `max_delay`.
    pub fn delay_for(&self, error: &Error, attempt: u32) -> Duration {
        match error.retry_after() {
            Some(d) => d.min(self.max_delay),
            None => self.calculate_delay(attempt),
        }
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

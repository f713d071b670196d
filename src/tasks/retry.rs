//! Retry policy for failed task executions.
//!
//! Retries run inside the same busy slot, so a retrying task still counts as
//! busy to its triggers.
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! backoff = "exponential"
//! interval_secs = 0.5
//! multiplier = 2.0
//! max_interval_secs = 30.0
//! ```

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Wait `interval_secs` between every attempt.
    #[default]
    Fixed,
    /// Wait `interval_secs * multiplier^n`, capped at `max_interval_secs`.
    Exponential,
}

/// Per-instance retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,
    #[serde(alias = "backoff_strategy")]
    pub backoff: Backoff,
    #[serde(alias = "backoff_interval_seconds")]
    pub interval_secs: f64,
    #[serde(alias = "backoff_multiplier")]
    pub multiplier: f64,
    #[serde(alias = "backoff_max_interval_seconds")]
    pub max_interval_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            interval_secs: 1.0,
            multiplier: 2.0,
            max_interval_secs: 60.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Up to `max_attempts` attempts with a fixed delay.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            interval_secs: interval.as_secs_f64(),
            ..Self::default()
        }
    }

    /// Effective attempt count (at least 1).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let first = self.interval_secs.max(0.0);
        let max = self.max_interval_secs.max(first);
        let secs = match self.backoff {
            Backoff::Fixed => first,
            Backoff::Exponential => {
                let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                first * self.multiplier.powi(exp)
            }
        };
        if !secs.is_finite() || secs > max {
            Duration::from_secs_f64(max)
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Rejects negative or non-finite timings.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] describing the bad field.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("interval_secs", self.interval_secs),
            ("multiplier", self.multiplier),
            ("max_interval_secs", self.max_interval_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(HubError::Validation {
                    reason: format!("retry.{field} must be a non-negative number"),
                });
            }
        }
        Ok(())
    }
}

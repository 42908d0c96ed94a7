//! # Retry Policy
//!
//! Exponential backoff for failed reconciliations.
//!
//! A policy is parameterized by an initial interval, a multiplier, an optional
//! interval cap and the maximum number of controller invocations per failure
//! episode. Each resource that fails gets its own [`RetryExecution`]; a success
//! drops it and the next failure starts a new episode from the initial interval.
//!
//! ## Usage
//!
//! ```rust
//! use operator_engine::retry::{GenericRetry, RetryConfiguration};
//! use std::time::Duration;
//!
//! let retry = GenericRetry::new(RetryConfiguration {
//!     initial_interval: Duration::from_secs(2),
//!     multiplier: 1.5,
//!     max_interval: None,
//!     max_attempts: 3,
//! });
//! let mut execution = retry.init_execution();
//! assert_eq!(execution.next_delay(), Some(Duration::from_secs(2)));  // after 1st failure
//! assert_eq!(execution.next_delay(), Some(Duration::from_secs(3)));  // after 2nd failure
//! assert_eq!(execution.next_delay(), None);                          // 3rd failure: exhausted
//! ```

use crate::constants::{
    DEFAULT_RETRY_INITIAL_INTERVAL_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MULTIPLIER,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RetryConfigurationError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("max_interval {max:?} is smaller than initial_interval {initial:?}")]
    CapBelowInitial { initial: Duration, max: Duration },
}

/// Retry parameters of one controller
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfiguration {
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Factor applied to the delay after each further failure
    pub multiplier: f64,
    /// Upper bound of a single delay, uncapped when `None`
    pub max_interval: Option<Duration>,
    /// Controller invocations allowed per failure episode, the first one included
    pub max_attempts: u32,
}

impl Default for RetryConfiguration {
    /// 2s initial interval, x1.5 per failure, no cap, 5 attempts
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_interval: None,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryConfiguration {
    pub fn validate(&self) -> Result<(), RetryConfigurationError> {
        if self.max_attempts == 0 {
            return Err(RetryConfigurationError::ZeroAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RetryConfigurationError::InvalidMultiplier(self.multiplier));
        }
        if let Some(max) = self.max_interval {
            if max < self.initial_interval {
                return Err(RetryConfigurationError::CapBelowInitial {
                    initial: self.initial_interval,
                    max,
                });
            }
        }
        Ok(())
    }
}

/// Factory of per-resource retry executions
#[derive(Debug, Clone)]
pub struct GenericRetry {
    configuration: RetryConfiguration,
}

impl GenericRetry {
    #[must_use]
    pub fn new(configuration: RetryConfiguration) -> Self {
        Self { configuration }
    }

    #[must_use]
    pub fn configuration(&self) -> &RetryConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn init_execution(&self) -> RetryExecution {
        RetryExecution {
            configuration: self.configuration.clone(),
            attempts: 0,
            current_interval: self.configuration.initial_interval,
        }
    }
}

/// Backoff state of a single failure episode
#[derive(Debug, Clone)]
pub struct RetryExecution {
    configuration: RetryConfiguration,
    /// Failed invocations recorded so far
    attempts: u32,
    current_interval: Duration,
}

impl RetryExecution {
    /// Record a failed invocation and return the delay before the next one
    ///
    /// Returns `None` once `max_attempts` invocations have failed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.configuration.max_attempts {
            return None;
        }
        let delay = self.current_interval;
        let next = Duration::try_from_secs_f64(
            self.current_interval.as_secs_f64() * self.configuration.multiplier,
        )
        .unwrap_or(Duration::MAX);
        self.current_interval = match self.configuration.max_interval {
            Some(max) => next.min(max),
            None => next,
        };
        Some(delay)
    }

    /// Failed invocations in this episode
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True when the next failure exhausts the budget
    #[must_use]
    pub fn is_last_attempt(&self) -> bool {
        self.attempts.saturating_add(1) >= self.configuration.max_attempts
    }
}

/// Retry bookkeeping of one resource
#[derive(Debug, Clone)]
pub struct RetryState {
    pub execution: RetryExecution,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set once the episode ran out of attempts; no timer is pending
    pub exhausted: bool,
}

impl RetryState {
    #[must_use]
    pub fn new(execution: RetryExecution) -> Self {
        Self {
            execution,
            next_attempt_at: None,
            exhausted: false,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.execution.attempts()
    }
}

//! Run limits and source validation.
//!
//! Bounds every run through configurable limits on:
//! - Per-call, per-stage and per-run timeouts
//! - Concurrent provider calls
//! - Source duration and size

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::SourceArtifact;

use super::pipeline::RetryPolicy;

/// Limits applied to a single pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    /// Per inference call timeout in seconds (default: 90)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Per stage timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 900 = 15 min)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Provider calls in flight at once, across every stage (default: 4)
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Re-runs of failed tasks after a stage's first pass (default: 1)
    #[serde(default = "default_stage_retry_rounds")]
    pub stage_retry_rounds: u32,

    /// Retry policy for transport errors on a single model
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub source: SourceLimits,
}

fn default_call_timeout() -> u64 {
    90
}
fn default_stage_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    900
} // 15 min
fn default_max_concurrent_calls() -> usize {
    4
}
fn default_stage_retry_rounds() -> u32 {
    1
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout(),
            stage_timeout_seconds: default_stage_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_concurrent_calls: default_max_concurrent_calls(),
            stage_retry_rounds: default_stage_retry_rounds(),
            retry: RetryPolicy::default(),
            source: SourceLimits::default(),
        }
    }
}

impl RunLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Reject limits that would make every run fail or hang
    pub fn validate(&self) -> Result<(), SafetyViolation> {
        if self.max_concurrent_calls == 0 {
            return Err(SafetyViolation::InvalidLimit(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.call_timeout_seconds == 0
            || self.stage_timeout_seconds == 0
            || self.run_timeout_seconds == 0
        {
            return Err(SafetyViolation::InvalidLimit(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SafetyViolation::InvalidLimit(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        self.source.validate_bounds()
    }
}

/// Accepted source media envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLimits {
    /// Minimum duration in seconds (default: 10)
    #[serde(default = "default_min_duration")]
    pub min_duration_seconds: f64,

    /// Maximum duration in seconds (default: 300 = 5 min)
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: f64,

    /// Maximum video size in bytes (default: 100MB)
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
}

fn default_min_duration() -> f64 {
    10.0
}
fn default_max_duration() -> f64 {
    300.0
}
fn default_max_source_bytes() -> u64 {
    100 * 1024 * 1024
} // 100MB

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            min_duration_seconds: default_min_duration(),
            max_duration_seconds: default_max_duration(),
            max_source_bytes: default_max_source_bytes(),
        }
    }
}

impl SourceLimits {
    fn validate_bounds(&self) -> Result<(), SafetyViolation> {
        if self.min_duration_seconds > self.max_duration_seconds {
            return Err(SafetyViolation::InvalidLimit(format!(
                "min_duration_seconds {} exceeds max_duration_seconds {}",
                self.min_duration_seconds, self.max_duration_seconds
            )));
        }
        Ok(())
    }

    /// Validate a source against duration and size limits
    pub fn validate(&self, source: &SourceArtifact) -> Result<(), SafetyViolation> {
        let duration = source.duration_seconds();
        if !duration.is_finite() || duration < self.min_duration_seconds {
            return Err(SafetyViolation::TooShort {
                actual: duration,
                limit: self.min_duration_seconds,
            });
        }
        if duration > self.max_duration_seconds {
            return Err(SafetyViolation::TooLong {
                actual: duration,
                limit: self.max_duration_seconds,
            });
        }

        let size = source.size_bytes();
        if size == 0 {
            return Err(SafetyViolation::EmptySource);
        }
        if size > self.max_source_bytes {
            return Err(SafetyViolation::MaxSourceBytes {
                actual: size,
                limit: self.max_source_bytes,
            });
        }

        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SafetyViolation {
    #[error("Source too short: {actual}s < {limit}s")]
    TooShort { actual: f64, limit: f64 },

    #[error("Source too long: {actual}s > {limit}s")]
    TooLong { actual: f64, limit: f64 },

    #[error("Maximum source bytes exceeded: {actual} > {limit}")]
    MaxSourceBytes { actual: u64, limit: u64 },

    #[error("Source has no video data")]
    EmptySource,

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),
}

//! Pipeline stages and their aggregated outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{TaskPayload, TaskResult};

/// Identifier of a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Whole-video context: subject identification, baseline
    Video,
    /// Transcript and raw voice analysis
    Audio,
    /// Visual behavior sub-analyses
    Visual,
    /// Vocal and linguistic sub-analyses
    Voice,
    /// Cross-channel analyses over video and audio together
    Multimodal,
    /// Text-only synthesis over every upstream output
    Synthesis,
}

impl StageId {
    /// Every stage, in declaration order
    pub const ALL: [StageId; 6] = [
        StageId::Video,
        StageId::Audio,
        StageId::Visual,
        StageId::Voice,
        StageId::Multimodal,
        StageId::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Video => "video",
            StageId::Audio => "audio",
            StageId::Visual => "visual",
            StageId::Voice => "voice",
            StageId::Multimodal => "multimodal",
            StageId::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Lifecycle status of one stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    Pending,

    /// Tasks are executing
    Running,

    /// Every task succeeded
    Succeeded,

    /// Minimum required work succeeded, some tasks were lost
    Degraded,

    /// Required work failed; dependents never start
    Failed,

    /// Never started because the graph halted or the run was cancelled
    Skipped,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StageStatus {
    /// Whether dependents may consume this stage's output
    pub fn is_usable(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Degraded)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }
}

/// Aggregated, read-only results of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: StageId,

    pub status: StageStatus,

    /// Final result per task name
    pub results: BTreeMap<String, TaskResult>,

    /// Earlier attempts replaced by a stage-level retry round
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<TaskResult>,

    /// Stage-level error (timeout), distinct from per-task errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl StageOutput {
    /// Results that carry a usable payload (succeeded or cached)
    pub fn usable_results(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.values().filter(|r| r.is_usable())
    }

    /// Payloads keyed by task name, for usable results only
    pub fn payloads(&self) -> BTreeMap<&str, &TaskPayload> {
        self.results
            .iter()
            .filter_map(|(name, result)| result.payload.as_ref().map(|p| (name.as_str(), p)))
            .collect()
    }

    /// Names of tasks whose final result failed
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_usable())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_round_trip_names() {
        for stage in StageId::ALL {
            assert_eq!(stage.as_str().parse::<StageId>().unwrap(), stage);
        }
        assert!("bogus".parse::<StageId>().is_err());
    }

    #[test]
    fn test_stage_status_usability() {
        assert!(StageStatus::Succeeded.is_usable());
        assert!(StageStatus::Degraded.is_usable());
        assert!(!StageStatus::Failed.is_usable());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }
}

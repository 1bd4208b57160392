//! Event types for the append-only run audit log.
//!
//! Every run, stage and task transition is recorded as an immutable event.
//! Replaying a run's events reconstructs its stage timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{StageId, StageStatus};

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage the event concerns (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,

    /// Task name within the stage (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO media, NO payloads)
    pub payload_summary: String,

    /// Stage status after this event (stage events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,

    /// Cache fingerprint of the task (task events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a run-level event with the current timestamp
    pub fn run(run_id: Uuid, event_type: EventType, payload_summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage: None,
            task: None,
            event_type,
            payload_summary: payload_summary.into(),
            status: None,
            fingerprint: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a stage-level event
    pub fn stage(
        run_id: Uuid,
        stage: StageId,
        event_type: EventType,
        status: StageStatus,
        payload_summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::run(run_id, event_type, payload_summary);
        event.stage = Some(stage);
        event.status = Some(status);
        event
    }

    /// Create a task-level event
    pub fn task(
        run_id: Uuid,
        stage: StageId,
        task: impl Into<String>,
        event_type: EventType,
        payload_summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::run(run_id, event_type, payload_summary);
        event.stage = Some(stage);
        event.task = Some(task.into());
        event
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach the task's cache fingerprint
    pub fn with_fingerprint(mut self, fingerprint: String) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

/// Types of events that can occur during a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run completed (possibly with degraded stages)
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A run was cancelled
    RunCancelled,

    /// A stage began executing its tasks
    StageStarted,

    /// A stage reached succeeded or degraded
    StageCompleted,

    /// A stage failed its required subset or timed out
    StageFailed,

    /// A stage never started
    StageSkipped,

    /// A task produced a fresh payload
    TaskSucceeded,

    /// A task was served from the cache
    TaskCached,

    /// A task exhausted every candidate model
    TaskFailed,
}

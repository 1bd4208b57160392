//! Pipeline run state and reconstruction from events.
//!
//! A `PipelineRun` is one execution of the stage graph over one source
//! artifact. Terminal runs are handed to the persistence collaborator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};
use super::profile::{ConflictRecord, SynthesizedProfile};
use super::source::SourceSummary;
use super::stage::{StageId, StageOutput, StageStatus};
use super::task::InferenceErrorKind;

/// Why a run ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailureKind {
    /// A stage lost its required subset
    StageFailed,

    /// The run or a stage exceeded its time budget
    Timeout,

    /// Configuration prevented any stage from starting
    FatalConfig,
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Accepted, no stage started yet
    Pending,

    /// Stages are executing
    Running,

    /// Every stage reached succeeded or degraded
    Completed,

    /// Halted; the completed prefix is retained
    Failed {
        kind: RunFailureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<StageId>,
        error: String,
    },

    /// Aborted by the caller
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }

    /// Short label for listings
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed { .. } => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// One entry in a run's "what failed and why" list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub stage: StageId,

    /// `None` for stage-level failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InferenceErrorKind>,

    pub message: String,
}

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Optional caller-supplied subject identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    pub source: SourceSummary,

    pub state: RunState,

    /// Status of every stage in the graph
    pub stages: BTreeMap<StageId, StageStatus>,

    /// Outputs of stages that ran to a terminal status
    pub outputs: BTreeMap<StageId, StageOutput>,

    /// Everything that failed, task and stage level
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureNote>,

    /// Synthesized (possibly partial) profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<SynthesizedProfile>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a pending run over the given stages
    pub fn new(
        id: Uuid,
        subject_id: Option<String>,
        source: SourceSummary,
        stages: impl IntoIterator<Item = StageId>,
    ) -> Self {
        Self {
            id,
            subject_id,
            source,
            state: RunState::Pending,
            stages: stages
                .into_iter()
                .map(|stage| (stage, StageStatus::Pending))
                .collect(),
            outputs: BTreeMap::new(),
            failures: Vec::new(),
            profile: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Stages that finished degraded
    pub fn degraded_stages(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, status)| **status == StageStatus::Degraded)
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// Unresolved cross-modal conflicts from the profile
    pub fn conflicts(&self) -> &[ConflictRecord] {
        self.profile
            .as_ref()
            .map(|p| p.conflicts.as_slice())
            .unwrap_or(&[])
    }
}

/// Progress signal published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Uuid,

    pub state: RunState,

    /// Stages currently executing
    pub running: Vec<StageId>,

    /// Stages that reached a terminal status; never decreases
    pub completed: usize,

    pub total: usize,
}

impl RunProgress {
    pub fn new(run_id: Uuid, total: usize) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            running: Vec::new(),
            completed: 0,
            total,
        }
    }

    /// Completion ratio in [0, 1]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}

/// Stage timeline rebuilt from an event log
#[derive(Debug, Clone, PartialEq)]
pub struct RunTimeline {
    pub run_id: Uuid,
    pub state: RunState,
    pub stages: BTreeMap<StageId, StageStatus>,
    pub tasks_succeeded: usize,
    pub tasks_cached: usize,
    pub tasks_failed: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunTimeline {
    /// Reconstruct a timeline from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut timeline = Self {
            run_id: first_event.run_id,
            state: RunState::Pending,
            stages: BTreeMap::new(),
            tasks_succeeded: 0,
            tasks_cached: 0,
            tasks_failed: 0,
            started_at: first_event.timestamp,
            completed_at: None,
        };

        for event in events {
            timeline.apply_event(event);
        }

        Some(timeline)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    kind: RunFailureKind::StageFailed,
                    stage: event.stage,
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
            EventType::StageStarted
            | EventType::StageCompleted
            | EventType::StageFailed
            | EventType::StageSkipped => {
                if let (Some(stage), Some(status)) = (event.stage, event.status) {
                    self.stages.insert(stage, status);
                }
            }
            EventType::TaskSucceeded => self.tasks_succeeded += 1,
            EventType::TaskCached => self.tasks_cached += 1,
            EventType::TaskFailed => self.tasks_failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::{Resolution, SourceArtifact};

    #[test]
    fn test_run_creation() {
        let run_id = Uuid::new_v4();
        let source = SourceArtifact::new("clip", vec![1], 20.0, Resolution::new(640, 480));
        let run = PipelineRun::new(run_id, None, source.summary(), StageId::ALL);

        assert_eq!(run.id, run_id);
        assert!(!run.state.is_terminal());
        assert_eq!(run.stages.len(), 6);
        assert!(run.conflicts().is_empty());
    }

    #[test]
    fn test_timeline_from_events() {
        let run_id = Uuid::new_v4();

        let events = vec![
            Event::run(run_id, EventType::RunStarted, "Run started"),
            Event::stage(
                run_id,
                StageId::Video,
                EventType::StageStarted,
                StageStatus::Running,
                "Stage started",
            ),
            Event::task(run_id, StageId::Video, "subject_identification", EventType::TaskCached, "cached"),
            Event::task(run_id, StageId::Video, "deepfake_detection", EventType::TaskFailed, "failed"),
            Event::stage(
                run_id,
                StageId::Video,
                EventType::StageCompleted,
                StageStatus::Degraded,
                "Stage degraded",
            ),
            Event::run(run_id, EventType::RunCompleted, "Run completed"),
        ];

        let timeline = RunTimeline::from_events(&events).unwrap();

        assert_eq!(timeline.run_id, run_id);
        assert_eq!(timeline.state, RunState::Completed);
        assert_eq!(timeline.stages[&StageId::Video], StageStatus::Degraded);
        assert_eq!(timeline.tasks_cached, 1);
        assert_eq!(timeline.tasks_failed, 1);
        assert!(timeline.completed_at.is_some());
    }

    #[test]
    fn test_progress_fraction() {
        let mut progress = RunProgress::new(Uuid::new_v4(), 6);
        assert_eq!(progress.fraction(), 0.0);
        progress.completed = 3;
        assert!((progress.fraction() - 0.5).abs() < 1e-9);
    }
}

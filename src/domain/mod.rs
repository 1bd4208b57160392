//! Domain types for the profiling pipeline.
//!
//! This module contains the core data structures:
//! - Source: the validated media artifact
//! - Task: task specifications and immutable results
//! - Stage: stage identifiers and aggregated outputs
//! - Run: pipeline run state, progress, and event replay
//! - Events: immutable audit records
//! - Profile: the synthesized, conflict-annotated output

pub mod events;
pub mod profile;
pub mod run;
pub mod source;
pub mod stage;
pub mod task;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use profile::{
    AxisResolution, AxisStatus, ConfidenceLevel, ConflictRecord, CorroboratedMoment,
    Corroboration, Modality, ModalityVerdict, ResolutionStrategy, SynthesizedProfile,
};
pub use run::{FailureNote, PipelineRun, RunFailureKind, RunProgress, RunState, RunTimeline};
pub use source::{Resolution, SourceArtifact, SourceSummary};
pub use stage::{StageId, StageOutput, StageStatus};
pub use task::{
    AxisReading, CallAttempt, EvidenceSpan, Facet, InferenceErrorKind, PromptTemplate,
    TaskError, TaskKey, TaskPayload, TaskResult, TaskRole, TaskSpec, TaskStatus,
};

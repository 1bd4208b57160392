//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: stage definitions and the dependency graph
//! - Executor: bounded, deduplicated task fan-out within a stage
//! - Inference: model fallback and retry around a provider
//! - Cache: fingerprinted result store with in-flight dedupe
//! - Resolver: cross-modal conflict resolution into a profile
//! - Orchestrator: run lifecycle, timeouts and cancellation

pub mod cache;
pub mod event_store;
pub mod executor;
pub mod inference;
pub mod orchestrator;
pub mod pipeline;
pub mod resolver;
pub mod safety;
pub mod signals;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use event_store::{EventStore, NullSink, RunSink};
pub use executor::{fingerprint, StageInputs, TaskExecutor};
pub use inference::InferenceClient;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, PipelineError, RunResult};
pub use pipeline::{DefinitionError, PipelineDefinition, RetryPolicy, StageGraph, StageSpec};
pub use resolver::{AxisDefinition, ConflictResolver, PrecedencePolicy, ResolverConfig};
pub use safety::{RunLimits, SafetyViolation, SourceLimits};

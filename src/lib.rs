//! behavioral-profiler - Multi-stage behavioral profiling pipeline
//!
//! Orchestrates many independent model calls over one video source,
//! grouped into dependent stages, and fuses their outputs into a single
//! conflict-annotated profile.
//!
//! # Architecture
//!
//! - Stages form an explicit dependency graph; a stage starts as soon as
//!   every predecessor is usable
//! - Tasks within a stage fan out under a concurrency bound, each walking
//!   an ordered list of candidate models
//! - Results are cached by fingerprint and identical concurrent requests
//!   share one provider call
//! - Cross-modal disagreements are resolved by a named precedence policy
//!   and recorded, never silently dropped
//! - Every state change is appended to a per-run event log
//!
//! # Modules
//!
//! - `adapters`: Inference provider seam (OpenRouter)
//! - `core`: Orchestration logic (executor, cache, resolver, event store)
//! - `domain`: Data structures (source, tasks, stages, runs, profile)
//! - `config`: Config file discovery and environment overrides
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline over a prepared source
//! profiler run source.yaml --output profile.json
//!
//! # Check run status
//! profiler status <run-id>
//!
//! # Show the stage graph
//! profiler graph
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{InferenceProvider, OpenRouterProvider};
pub use config::ResolvedConfig;
pub use core::{Orchestrator, PipelineError, ResultCache};
pub use domain::{Event, EventType, PipelineRun, RunState, SourceArtifact, SynthesizedProfile};

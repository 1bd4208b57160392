//! Main orchestrator for pipeline execution.
//!
//! Schedules stages over the validated stage graph, starting every stage
//! whose predecessors are usable, and coordinates event logging, timeouts,
//! cancellation, progress reporting and final profile synthesis.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{InferenceProvider, ProviderError};
use crate::domain::{
    Event, EventType, FailureNote, InferenceErrorKind, PipelineRun, RunFailureKind, RunProgress,
    RunState, SourceArtifact, StageId, StageOutput, StageStatus, TaskStatus,
};

use super::cache::ResultCache;
use super::event_store::{NullSink, RunSink};
use super::executor::{StageInputs, TaskExecutor};
use super::inference::InferenceClient;
use super::pipeline::{DefinitionError, PipelineDefinition, StageGraph, StageSpec};
use super::resolver::{ConflictResolver, ResolverConfig};
use super::safety::{RunLimits, SafetyViolation};
use super::signals;

/// Errors surfaced by the orchestrator
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: StageId, message: String },

    #[error("Run timed out: {0}")]
    Timeout(String),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("Invalid source: {0}")]
    InvalidSource(#[from] SafetyViolation),

    #[error("Invalid run limits: {0}")]
    InvalidLimits(SafetyViolation),

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),
}

impl PipelineError {
    /// The error a finished run ended with, if it did not complete
    pub fn from_run(run: &PipelineRun) -> Option<Self> {
        match &run.state {
            RunState::Failed { kind, stage, error } => Some(match (kind, stage) {
                (RunFailureKind::Timeout, _) => PipelineError::Timeout(error.clone()),
                (RunFailureKind::FatalConfig, _) => PipelineError::FatalConfig(error.clone()),
                (RunFailureKind::StageFailed, Some(stage)) => PipelineError::StageFailed {
                    stage: *stage,
                    message: error.clone(),
                },
                (RunFailureKind::StageFailed, None) => PipelineError::FatalConfig(error.clone()),
            }),
            RunState::Cancelled => Some(PipelineError::Cancelled),
            _ => None,
        }
    }
}

/// Answer to `Orchestrator::get_result`
#[derive(Debug, Clone)]
pub enum RunResult {
    InProgress(RunProgress),
    Finished(Box<PipelineRun>),
}

enum GraphOutcome {
    Completed,
    StageFailed { stage: StageId, error: String },
    TimedOut,
    Cancelled,
}

struct RunEntry {
    progress: watch::Receiver<RunProgress>,
    cancel: CancellationToken,
    finished: Option<PipelineRun>,
}

struct Shared {
    definition: PipelineDefinition,
    graph: StageGraph,
    executor: TaskExecutor,
    resolver: ConflictResolver,
    limits: RunLimits,
    sink: Arc<dyn RunSink>,
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

/// Builder for an `Orchestrator`
pub struct OrchestratorBuilder {
    provider: Arc<dyn InferenceProvider>,
    definition: PipelineDefinition,
    cache: ResultCache,
    limits: RunLimits,
    resolver: ResolverConfig,
    sink: Arc<dyn RunSink>,
}

impl OrchestratorBuilder {
    pub fn definition(mut self, definition: PipelineDefinition) -> Self {
        self.definition = definition;
        self
    }

    /// Share a cache with other orchestrators or runs
    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the definition and limits and assemble the orchestrator
    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        let graph = self.definition.validate()?;
        self.limits.validate().map_err(PipelineError::InvalidLimits)?;

        let client = InferenceClient::new(
            self.provider,
            self.limits.retry.clone(),
            self.limits.call_timeout(),
        );
        let executor = TaskExecutor::new(
            client,
            self.cache,
            self.limits.max_concurrent_calls,
            self.limits.stage_retry_rounds,
            self.limits.retry.clone(),
        );

        Ok(Orchestrator {
            shared: Arc::new(Shared {
                definition: self.definition,
                graph,
                executor,
                resolver: ConflictResolver::new(self.resolver),
                limits: self.limits,
                sink: self.sink,
                runs: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Main pipeline orchestrator. Clones share the run registry.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Start building an orchestrator over the standard pipeline
    pub fn builder(provider: Arc<dyn InferenceProvider>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            provider,
            definition: PipelineDefinition::standard(),
            cache: ResultCache::in_memory(),
            limits: RunLimits::default(),
            resolver: ResolverConfig::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.shared.definition
    }

    pub fn graph(&self) -> &StageGraph {
        &self.shared.graph
    }

    pub fn cache(&self) -> &ResultCache {
        self.shared.executor.cache()
    }

    /// Execute a run to completion and return it
    #[instrument(skip(self, source), fields(source = %source.label()))]
    pub async fn execute(
        &self,
        source: SourceArtifact,
        subject_id: Option<String>,
    ) -> Result<PipelineRun, PipelineError> {
        let (run, progress, cancel) = self.admit(&source, subject_id)?;
        let run = self.drive(run, source, progress, cancel).await;
        // The caller owns the finished run; nothing left to poll
        self.runs().remove(&run.id);
        Ok(run)
    }

    /// Start a run in the background and return its id
    #[instrument(skip(self, source), fields(source = %source.label()))]
    pub fn start_run(
        &self,
        source: SourceArtifact,
        subject_id: Option<String>,
    ) -> Result<Uuid, PipelineError> {
        let (run, progress, cancel) = self.admit(&source, subject_id)?;
        let run_id = run.id;

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run, source, progress, cancel).await;
        });

        Ok(run_id)
    }

    /// Latest progress of a run
    pub fn get_progress(&self, run_id: Uuid) -> Result<RunProgress, PipelineError> {
        self.with_entry(run_id, |entry| entry.progress.borrow().clone())
    }

    /// Push-style progress updates for a run
    pub fn subscribe(&self, run_id: Uuid) -> Result<watch::Receiver<RunProgress>, PipelineError> {
        self.with_entry(run_id, |entry| entry.progress.clone())
    }

    /// The finished run, or its progress while still executing
    pub fn get_result(&self, run_id: Uuid) -> Result<RunResult, PipelineError> {
        self.with_entry(run_id, |entry| match &entry.finished {
            Some(run) => RunResult::Finished(Box::new(run.clone())),
            None => RunResult::InProgress(entry.progress.borrow().clone()),
        })
    }

    /// Request cancellation; returns whether the run was still active
    pub fn cancel_run(&self, run_id: Uuid) -> Result<bool, PipelineError> {
        self.with_entry(run_id, |entry| {
            let active = entry.finished.is_none();
            if active {
                entry.cancel.cancel();
            }
            active
        })
    }

    /// Release a finished run, handing back its record. Active runs stay
    /// registered and yield `None`.
    pub fn forget_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, PipelineError> {
        let mut runs = self.runs();
        let entry = runs.get(&run_id).ok_or(PipelineError::UnknownRun(run_id))?;
        if entry.finished.is_none() {
            return Ok(None);
        }
        Ok(runs.remove(&run_id).and_then(|entry| entry.finished))
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.shared
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(
        &self,
        run_id: Uuid,
        f: impl FnOnce(&RunEntry) -> T,
    ) -> Result<T, PipelineError> {
        self.runs()
            .get(&run_id)
            .map(f)
            .ok_or(PipelineError::UnknownRun(run_id))
    }

    /// Validate the source and register a pending run
    fn admit(
        &self,
        source: &SourceArtifact,
        subject_id: Option<String>,
    ) -> Result<(PipelineRun, watch::Sender<RunProgress>, CancellationToken), PipelineError> {
        self.shared.limits.source.validate(source)?;

        let graph = &self.shared.graph;
        let run = PipelineRun::new(
            Uuid::new_v4(),
            subject_id,
            source.summary(),
            graph.topological_order().iter().copied(),
        );
        let (tx, rx) = watch::channel(RunProgress::new(run.id, graph.len()));
        let cancel = CancellationToken::new();

        self.runs()
            .insert(
                run.id,
                RunEntry {
                    progress: rx,
                    cancel: cancel.clone(),
                    finished: None,
                },
            );

        Ok((run, tx, cancel))
    }

    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn drive(
        &self,
        mut run: PipelineRun,
        source: SourceArtifact,
        progress: watch::Sender<RunProgress>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        run.state = RunState::Running;
        run.started_at = Utc::now();
        info!(
            stages = self.shared.graph.len(),
            provider = self.shared.executor.client().provider_name(),
            "Starting run"
        );
        self.emit(Event::run(
            run.id,
            EventType::RunStarted,
            format!("Run started for '{}'", source.label()),
        ))
        .await;
        publish(&run, &progress);

        let templates = self.shared.definition.templates();
        match self.shared.executor.client().preflight(&templates).await {
            Ok(()) => {}
            Err(ProviderError::Config(message)) => {
                error!(error = %message, "Provider preflight failed");
                let state = RunState::Failed {
                    kind: RunFailureKind::FatalConfig,
                    stage: None,
                    error: message,
                };
                return self.finish(run, state, &progress).await;
            }
            Err(other) => warn!(error = %other, "Provider preflight inconclusive; continuing"),
        }

        let outcome = {
            let graph = self.run_graph(&mut run, &source, &progress);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => GraphOutcome::Cancelled,
                result = timeout(self.shared.limits.run_timeout(), graph) => {
                    result.unwrap_or(GraphOutcome::TimedOut)
                }
            }
        };

        let state = match outcome {
            GraphOutcome::Completed => RunState::Completed,
            GraphOutcome::StageFailed { stage, error } => RunState::Failed {
                kind: RunFailureKind::StageFailed,
                stage: Some(stage),
                error,
            },
            GraphOutcome::TimedOut => RunState::Failed {
                kind: RunFailureKind::Timeout,
                stage: None,
                error: format!(
                    "Run exceeded {}s",
                    self.shared.limits.run_timeout_seconds
                ),
            },
            GraphOutcome::Cancelled => RunState::Cancelled,
        };

        self.finish(run, state, &progress).await
    }

    /// Start ready stages until the graph drains or a stage fails
    async fn run_graph(
        &self,
        run: &mut PipelineRun,
        source: &SourceArtifact,
        progress: &watch::Sender<RunProgress>,
    ) -> GraphOutcome {
        let mut in_flight = FuturesUnordered::new();

        loop {
            for stage in self.shared.graph.ready(&run.stages) {
                let Some(spec) = self.shared.definition.stage(stage) else {
                    continue;
                };
                let inputs = self.stage_inputs(stage, run, source);

                run.stages.insert(stage, StageStatus::Running);
                info!(stage = %stage, tasks = spec.tasks.len(), "Stage started");
                self.emit(Event::stage(
                    run.id,
                    stage,
                    EventType::StageStarted,
                    StageStatus::Running,
                    format!("Stage '{}' started", stage),
                ))
                .await;

                in_flight.push(self.run_stage_bounded(spec, inputs));
            }
            publish(run, progress);

            let Some(output) = in_flight.next().await else {
                break;
            };

            let stage = output.stage;
            let status = output.status;
            let stage_error = output.error.clone();
            self.record_stage(run, output).await;
            publish(run, progress);

            if status == StageStatus::Failed {
                let error = stage_error
                    .unwrap_or_else(|| format!("Stage '{}' lost every required task", stage));
                return GraphOutcome::StageFailed { stage, error };
            }
        }

        GraphOutcome::Completed
    }

    /// Ancestor outputs, plus collapsed moments for synthesis
    fn stage_inputs(&self, stage: StageId, run: &PipelineRun, source: &SourceArtifact) -> StageInputs {
        let prior: BTreeMap<StageId, StageOutput> = self
            .shared
            .graph
            .ancestors(stage)
            .into_iter()
            .filter_map(|s| run.outputs.get(&s).map(|o| (s, o.clone())))
            .collect();

        let moments = if stage == StageId::Synthesis {
            signals::collapse_outputs(
                signals::upstream_outputs(&prior),
                self.shared.resolver.config().moment_window_seconds,
            )
        } else {
            Vec::new()
        };

        StageInputs {
            source: source.clone(),
            prior,
            moments,
        }
    }

    async fn run_stage_bounded(&self, spec: &StageSpec, inputs: StageInputs) -> StageOutput {
        let started_at = Utc::now();
        let limit = self.shared.limits.stage_timeout();

        match timeout(limit, self.shared.executor.run_stage(spec, &inputs)).await {
            Ok(output) => output,
            Err(_) => StageOutput {
                stage: spec.id,
                status: StageStatus::Failed,
                results: BTreeMap::new(),
                superseded: Vec::new(),
                error: Some(format!(
                    "Stage exceeded {}s",
                    self.shared.limits.stage_timeout_seconds
                )),
                started_at,
                finished_at: Utc::now(),
            },
        }
    }

    /// Log a finished stage's tasks and fold the output into the run
    async fn record_stage(&self, run: &mut PipelineRun, output: StageOutput) {
        let stage = output.stage;

        for result in output.results.values() {
            let name = &result.task.name;
            let (event_type, summary) = match result.status {
                TaskStatus::Succeeded => (
                    EventType::TaskSucceeded,
                    format!(
                        "Task '{}' succeeded on {}",
                        name,
                        result.model.as_deref().unwrap_or("unknown model")
                    ),
                ),
                TaskStatus::Cached => (
                    EventType::TaskCached,
                    format!("Task '{}' served from cache", name),
                ),
                TaskStatus::Failed => (
                    EventType::TaskFailed,
                    format!("Task '{}' failed after {} calls", name, result.attempts.len()),
                ),
            };

            let mut event = Event::task(run.id, stage, name.clone(), event_type, summary)
                .with_duration(result.latency_ms)
                .with_fingerprint(result.fingerprint.clone());

            if let Some(err) = &result.error {
                event = event.with_error(err.message.clone());
                run.failures.push(FailureNote {
                    stage,
                    task: Some(name.clone()),
                    kind: Some(err.kind),
                    message: err.message.clone(),
                });
            }
            self.emit(event).await;
        }

        if let Some(message) = &output.error {
            run.failures.push(FailureNote {
                stage,
                task: None,
                kind: Some(InferenceErrorKind::Timeout),
                message: message.clone(),
            });
        }

        let duration_ms = output.duration_ms();
        let (event_type, mut event_error) = match output.status {
            StageStatus::Failed => (EventType::StageFailed, output.error.clone()),
            _ => (EventType::StageCompleted, None),
        };
        if output.status == StageStatus::Failed && event_error.is_none() {
            event_error = Some(format!("Failed tasks: {}", output.failed_tasks().join(", ")));
        }

        match output.status {
            StageStatus::Succeeded => info!(stage = %stage, duration_ms, "Stage succeeded"),
            StageStatus::Degraded => warn!(
                stage = %stage,
                duration_ms,
                failed = ?output.failed_tasks(),
                "Stage degraded"
            ),
            _ => error!(stage = %stage, duration_ms, "Stage failed"),
        }

        let mut event = Event::stage(
            run.id,
            stage,
            event_type,
            output.status,
            format!("Stage '{}' {:?}", stage, output.status),
        )
        .with_duration(duration_ms);
        if let Some(err) = event_error {
            event = event.with_error(err);
        }
        self.emit(event).await;

        run.stages.insert(stage, output.status);
        run.outputs.insert(stage, output);
    }

    /// Close out a run: skip unfinished stages, synthesize, persist, publish
    async fn finish(
        &self,
        mut run: PipelineRun,
        state: RunState,
        progress: &watch::Sender<RunProgress>,
    ) -> PipelineRun {
        let mut skipped = Vec::new();
        for (stage, status) in run.stages.iter_mut() {
            if status.is_terminal() {
                continue;
            }
            if *status == StageStatus::Running {
                run.failures.push(FailureNote {
                    stage: *stage,
                    task: None,
                    kind: None,
                    message: format!("Abandoned when the run became {}", state.label()),
                });
            }
            *status = StageStatus::Skipped;
            skipped.push(*stage);
        }
        for stage in skipped {
            self.emit(Event::stage(
                run.id,
                stage,
                EventType::StageSkipped,
                StageStatus::Skipped,
                format!("Stage '{}' skipped", stage),
            ))
            .await;
        }

        let moments = signals::collapse_outputs(
            signals::upstream_outputs(&run.outputs),
            self.shared.resolver.config().moment_window_seconds,
        );
        let partial = state != RunState::Completed;
        run.profile = Some(
            self.shared
                .resolver
                .synthesize(&run.outputs, &run.source, moments, partial),
        );
        run.state = state;
        run.completed_at = Some(Utc::now());

        let duration_ms = (Utc::now() - run.started_at).num_milliseconds().max(0) as u64;
        let (event_type, summary) = match &run.state {
            RunState::Completed => (EventType::RunCompleted, "Run completed".to_string()),
            RunState::Cancelled => (EventType::RunCancelled, "Run cancelled".to_string()),
            _ => (EventType::RunFailed, "Run failed".to_string()),
        };
        let mut event = Event::run(run.id, event_type, summary).with_duration(duration_ms);
        if let RunState::Failed { stage, error, .. } = &run.state {
            event.stage = *stage;
            event = event.with_error(error.clone());
            error!(error = %error, duration_ms, "Run failed");
        } else {
            info!(
                state = run.state.label(),
                duration_ms,
                degraded = ?run.degraded_stages(),
                "Run finished"
            );
        }
        self.emit(event).await;

        if let Err(e) = self.shared.sink.persist(&run).await {
            warn!(error = %e, "Failed to persist run record");
        }

        if let Some(entry) = self.runs().get_mut(&run.id) {
            entry.finished = Some(run.clone());
        }
        publish(&run, progress);

        run
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.shared.sink.record(&event).await {
            warn!(error = %e, event_type = ?event.event_type, "Failed to record event");
        }
    }
}

fn publish(run: &PipelineRun, progress: &watch::Sender<RunProgress>) {
    let running = run
        .stages
        .iter()
        .filter(|(_, s)| **s == StageStatus::Running)
        .map(|(stage, _)| *stage)
        .collect();
    let completed = run.stages.values().filter(|s| s.is_terminal()).count();

    progress.send_replace(RunProgress {
        run_id: run.id,
        state: run.state.clone(),
        running,
        completed,
        total: run.stages.len(),
    });
}

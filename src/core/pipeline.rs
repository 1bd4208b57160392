//! Pipeline definitions and the stage dependency graph.
//!
//! A pipeline is a fixed set of stages, each holding independently
//! schedulable tasks and a declared predecessor set. Definitions are built
//! in (`PipelineDefinition::standard`) or loaded from YAML.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    Facet, PromptTemplate, StageId, StageStatus, TaskResult, TaskRole, TaskSpec, TaskStatus,
};

/// Structural problems in a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Pipeline must have at least one stage")]
    NoStages,

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(StageId),

    #[error("Stage '{stage}' depends on undeclared stage '{missing}'")]
    UnknownPredecessor { stage: StageId, missing: StageId },

    #[error("Stage '{0}' depends on itself")]
    SelfDependency(StageId),

    #[error("Stage graph contains a cycle through: {0:?}")]
    Cycle(Vec<StageId>),

    #[error("Stage '{0}' has no tasks")]
    EmptyStage(StageId),

    #[error("Stage '{0}' has no required task")]
    NoRequiredTask(StageId),

    #[error("Task '{task}' is declared twice in stage '{stage}'")]
    DuplicateTask { stage: StageId, task: String },

    #[error("Task '{stage}/{task}' has no candidate models")]
    NoCandidateModels { stage: StageId, task: String },

    #[error("Task '{stage}/{task}' reads prior outputs but its stage has no predecessors")]
    PriorWithoutPredecessors { stage: StageId, task: String },
}

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Stages with their tasks and predecessor sets
    pub stages: Vec<StageSpec>,
}

/// One stage: its tasks and the stages it waits for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,

    #[serde(default)]
    pub predecessors: Vec<StageId>,

    pub tasks: Vec<TaskSpec>,
}

impl StageSpec {
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Classify the stage from its final task results.
    ///
    /// Missing results count as failures.
    pub fn evaluate(&self, results: &BTreeMap<String, TaskResult>) -> StageStatus {
        let usable = |task: &TaskSpec| {
            results
                .get(&task.name)
                .map(|r| r.status != TaskStatus::Failed)
                .unwrap_or(false)
        };

        let all_usable = self.tasks.iter().all(usable);
        if all_usable {
            return StageStatus::Succeeded;
        }

        let required_ok = self
            .tasks
            .iter()
            .filter(|t| t.role == TaskRole::Required)
            .any(usable);
        let fallback_ok = self
            .tasks
            .iter()
            .filter(|t| t.role == TaskRole::Fallback)
            .any(usable);

        if required_ok || fallback_ok {
            StageStatus::Degraded
        } else {
            StageStatus::Failed
        }
    }
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse and validate a pipeline definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self =
            serde_yaml::from_str(content).context("Failed to parse pipeline YAML")?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the definition and return its dependency graph
    pub fn validate(&self) -> Result<StageGraph, DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::NoStages);
        }

        for stage in &self.stages {
            if stage.tasks.is_empty() {
                return Err(DefinitionError::EmptyStage(stage.id));
            }
            if !stage.tasks.iter().any(|t| t.role == TaskRole::Required) {
                return Err(DefinitionError::NoRequiredTask(stage.id));
            }

            let mut names = HashSet::new();
            for task in &stage.tasks {
                if !names.insert(task.name.as_str()) {
                    return Err(DefinitionError::DuplicateTask {
                        stage: stage.id,
                        task: task.name.clone(),
                    });
                }
                if task.models.is_empty() {
                    return Err(DefinitionError::NoCandidateModels {
                        stage: stage.id,
                        task: task.name.clone(),
                    });
                }
                if task.uses(Facet::Prior) && stage.predecessors.is_empty() {
                    return Err(DefinitionError::PriorWithoutPredecessors {
                        stage: stage.id,
                        task: task.name.clone(),
                    });
                }
            }
        }

        StageGraph::new(
            self.stages
                .iter()
                .map(|s| (s.id, s.predecessors.clone())),
        )
    }

    /// Get a stage by id
    pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Every prompt template the definition references
    pub fn templates(&self) -> Vec<&PromptTemplate> {
        self.stages
            .iter()
            .flat_map(|s| s.tasks.iter().map(|t| &t.template))
            .collect()
    }

    /// The built-in six-stage behavioral pipeline
    pub fn standard() -> Self {
        use Facet::{Audio, Prior, Transcript, Video};
        use TaskRole::{Fallback, Optional, Required};

        const AV: &[&str] = &["google/gemini-2.5-flash", "google/gemini-2.5-pro"];
        const TEXT: &[&str] = &["openai/gpt-4.1", "anthropic/claude-sonnet-4"];

        let task = |name: &str, facets: &[Facet], models: &[&str], role: TaskRole| {
            TaskSpec::new(name, PromptTemplate::new(name, 1), facets, models, role)
        };

        Self {
            name: "behavioral".to_string(),
            description: "Video, audio and transcript sub-analyses reconciled into one profile"
                .to_string(),
            stages: vec![
                StageSpec {
                    id: StageId::Video,
                    predecessors: vec![],
                    tasks: vec![
                        task("subject_identification", &[Video], AV, Required),
                        task("baseline_establishment", &[Video], AV, Optional),
                        task("deepfake_detection", &[Video], AV, Optional),
                    ],
                },
                StageSpec {
                    id: StageId::Audio,
                    predecessors: vec![StageId::Video],
                    tasks: vec![
                        task("transcript", &[Audio, Transcript], AV, Required),
                        task("voice_tone", &[Audio], AV, Fallback),
                        task("liwc", &[Transcript], TEXT, Optional),
                    ],
                },
                StageSpec {
                    id: StageId::Visual,
                    predecessors: vec![StageId::Audio],
                    tasks: vec![
                        task("kinesic_log", &[Video, Prior], AV, Required),
                        task("congruence", &[Video, Transcript, Prior], AV, Optional),
                        task("archetype", &[Video], AV, Optional),
                        task("blink_rate", &[Video], AV, Optional),
                    ],
                },
                StageSpec {
                    id: StageId::Voice,
                    predecessors: vec![StageId::Audio],
                    tasks: vec![
                        task("audio_linguistic", &[Audio, Transcript, Prior], AV, Required),
                        task("detail_mountain_valley", &[Transcript], TEXT, Optional),
                        task("minimizing_language", &[Transcript], TEXT, Optional),
                    ],
                },
                StageSpec {
                    id: StageId::Multimodal,
                    predecessors: vec![StageId::Visual, StageId::Voice],
                    tasks: vec![
                        task("cross_modal_sync", &[Video, Audio, Prior], AV, Required),
                        task("camera_awareness", &[Video], AV, Optional),
                        task("five_cs", &[Video, Audio, Prior], AV, Optional),
                    ],
                },
                StageSpec {
                    id: StageId::Synthesis,
                    predecessors: vec![
                        StageId::Video,
                        StageId::Audio,
                        StageId::Visual,
                        StageId::Voice,
                        StageId::Multimodal,
                    ],
                    tasks: vec![
                        task("personality", &[Prior], TEXT, Required),
                        task("threat", &[Prior], TEXT, Optional),
                        task("nci_deception_summary", &[Prior], TEXT, Optional),
                        task("red_team", &[Prior], TEXT, Optional),
                    ],
                },
            ],
        }
    }
}

/// Validated directed acyclic graph of stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    predecessors: BTreeMap<StageId, BTreeSet<StageId>>,
    order: Vec<StageId>,
}

impl StageGraph {
    /// Build a graph from `(stage, predecessors)` pairs, rejecting unknown
    /// references, self loops and cycles
    pub fn new(
        edges: impl IntoIterator<Item = (StageId, Vec<StageId>)>,
    ) -> Result<Self, DefinitionError> {
        let mut predecessors: BTreeMap<StageId, BTreeSet<StageId>> = BTreeMap::new();
        let mut declared = Vec::new();

        for (stage, preds) in edges {
            if predecessors.contains_key(&stage) {
                return Err(DefinitionError::DuplicateStage(stage));
            }
            if preds.contains(&stage) {
                return Err(DefinitionError::SelfDependency(stage));
            }
            predecessors.insert(stage, preds.into_iter().collect());
            declared.push(stage);
        }

        if predecessors.is_empty() {
            return Err(DefinitionError::NoStages);
        }

        for (stage, preds) in &predecessors {
            if let Some(missing) = preds.iter().find(|p| !predecessors.contains_key(p)) {
                return Err(DefinitionError::UnknownPredecessor {
                    stage: *stage,
                    missing: *missing,
                });
            }
        }

        // Kahn's algorithm, seeded in declaration order for a stable order
        let mut remaining: BTreeMap<StageId, usize> = predecessors
            .iter()
            .map(|(stage, preds)| (*stage, preds.len()))
            .collect();
        let mut queue: VecDeque<StageId> = declared
            .iter()
            .copied()
            .filter(|s| remaining[s] == 0)
            .collect();
        let mut order = Vec::with_capacity(declared.len());

        while let Some(stage) = queue.pop_front() {
            order.push(stage);
            for candidate in &declared {
                if predecessors[candidate].contains(&stage) {
                    if let Some(count) = remaining.get_mut(candidate) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(*candidate);
                        }
                    }
                }
            }
        }

        if order.len() != declared.len() {
            let stuck = declared
                .into_iter()
                .filter(|s| !order.contains(s))
                .collect();
            return Err(DefinitionError::Cycle(stuck));
        }

        Ok(Self {
            predecessors,
            order,
        })
    }

    /// Stages in a valid execution order
    pub fn topological_order(&self) -> &[StageId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct predecessors of a stage
    pub fn predecessors(&self, stage: StageId) -> impl Iterator<Item = StageId> + '_ {
        self.predecessors
            .get(&stage)
            .into_iter()
            .flat_map(|preds| preds.iter().copied())
    }

    /// Every transitive predecessor of a stage
    pub fn ancestors(&self, stage: StageId) -> BTreeSet<StageId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<StageId> = self.predecessors(stage).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.predecessors(next));
            }
        }
        seen
    }

    /// Pending stages whose predecessors are all usable
    pub fn ready(&self, statuses: &BTreeMap<StageId, StageStatus>) -> Vec<StageId> {
        self.order
            .iter()
            .copied()
            .filter(|stage| {
                statuses.get(stage).copied().unwrap_or_default() == StageStatus::Pending
                    && self.predecessors(*stage).all(|pred| {
                        statuses
                            .get(&pred)
                            .map(|s| s.is_usable())
                            .unwrap_or(false)
                    })
            })
            .collect()
    }
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    2
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

//! Analysis task specifications and the immutable results they produce.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::StageId;

/// Source material a task consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Video,
    Audio,
    Transcript,
    /// Outputs of upstream stages
    Prior,
}

/// How a task counts toward its stage's usability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    /// At least one required task must succeed for the stage to be usable
    Required,

    /// Keeps the stage usable (degraded) when every required task failed
    Fallback,

    /// Cosmetic; losing it only degrades the stage
    Optional,
}

impl Default for TaskRole {
    fn default() -> Self {
        Self::Optional
    }
}

fn default_template_version() -> u32 {
    1
}

/// Versioned prompt template reference. The wording itself lives with the
/// inference provider; only identity matters here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,

    #[serde(default = "default_template_version")]
    pub version: u32,
}

impl PromptTemplate {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    /// File-name style key, e.g. `kinesic_log.v2`
    pub fn key(&self) -> String {
        format!("{}.v{}", self.id, self.version)
    }
}

/// Immutable definition of one analysis unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name (unique within its stage)
    pub name: String,

    pub template: PromptTemplate,

    /// Source facets passed to the provider
    #[serde(default)]
    pub facets: Vec<Facet>,

    /// Candidate models, most preferred first
    pub models: Vec<String>,

    #[serde(default)]
    pub role: TaskRole,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        template: PromptTemplate,
        facets: &[Facet],
        models: &[&str],
        role: TaskRole,
    ) -> Self {
        Self {
            name: name.into(),
            template,
            facets: facets.to_vec(),
            models: models.iter().map(|m| m.to_string()).collect(),
            role,
        }
    }

    pub fn uses(&self, facet: Facet) -> bool {
        self.facets.contains(&facet)
    }
}

/// Identity of a task within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub stage: StageId,
    pub name: String,
}

impl TaskKey {
    pub fn new(stage: StageId, name: impl Into<String>) -> Self {
        Self {
            stage,
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.name)
    }
}

/// One scored judgment axis as reported by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisReading {
    /// Pole label, e.g. "deceptive" or "authentic"; "neutral" for neither
    pub verdict: String,

    /// Self-reported confidence in [0, 1]
    pub confidence: f64,

    /// Strength of the verdict in [0, 1] (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
}

impl AxisReading {
    pub fn new(verdict: impl Into<String>, confidence: f64) -> Self {
        Self {
            verdict: verdict.into(),
            confidence,
            intensity: None,
        }
    }
}

/// A timestamped observation supporting a task's readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub start_seconds: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_seconds: Option<f64>,

    pub description: String,
}

/// Structured output of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Scored axes keyed by axis name (at least one)
    pub axes: BTreeMap<String, AxisReading>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceSpan>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Overall confidence; derived from the axes when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl TaskPayload {
    /// Check the structural contract every task payload must meet
    pub fn validate(&self) -> Result<(), String> {
        if self.axes.is_empty() {
            return Err("payload has no scored axis".to_string());
        }
        for (axis, reading) in &self.axes {
            if !(0.0..=1.0).contains(&reading.confidence) {
                return Err(format!(
                    "axis '{}' confidence {} outside [0, 1]",
                    axis, reading.confidence
                ));
            }
            if let Some(intensity) = reading.intensity {
                if !(0.0..=1.0).contains(&intensity) {
                    return Err(format!(
                        "axis '{}' intensity {} outside [0, 1]",
                        axis, intensity
                    ));
                }
            }
            if reading.verdict.trim().is_empty() {
                return Err(format!("axis '{}' has an empty verdict", axis));
            }
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(format!("payload confidence {} outside [0, 1]", confidence));
            }
        }
        for span in &self.evidence {
            if span.start_seconds < 0.0 {
                return Err(format!("evidence span starts before 0: {}", span.start_seconds));
            }
        }
        Ok(())
    }

    /// Declared confidence, or the mean of axis confidences
    pub fn overall_confidence(&self) -> f64 {
        if let Some(confidence) = self.confidence {
            return confidence;
        }
        if self.axes.is_empty() {
            return 0.0;
        }
        self.axes.values().map(|r| r.confidence).sum::<f64>() / self.axes.len() as f64
    }
}

/// Terminal status of a task execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Served from the result cache or a concurrent identical computation
    Cached,
}

/// Failure modes of an inference call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceErrorKind {
    /// Network or provider unavailable
    Transport,

    /// Unparseable or invalid structured output
    Schema,

    /// Per-call budget exceeded
    Timeout,

    /// Missing credentials, missing template, or similar
    FatalConfig,
}

impl fmt::Display for InferenceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InferenceErrorKind::Transport => "transport",
            InferenceErrorKind::Schema => "schema",
            InferenceErrorKind::Timeout => "timeout",
            InferenceErrorKind::FatalConfig => "fatal_config",
        };
        f.write_str(name)
    }
}

/// Error detail recorded on a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: InferenceErrorKind,
    pub message: String,
}

/// Telemetry for a single provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub model: String,
    pub latency_ms: u64,

    /// `None` when the call produced a valid payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InferenceErrorKind>,
}

/// Immutable record of one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: TaskKey,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TaskPayload>,

    /// Confidence in [0, 1]; 0 for failures
    pub confidence: f64,

    /// Model that produced the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub latency_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<CallAttempt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    pub fingerprint: String,

    pub created_at: DateTime<Utc>,
}

impl TaskResult {
    /// A payload freshly produced by `model`
    pub fn succeeded(
        task: TaskKey,
        fingerprint: String,
        payload: TaskPayload,
        model: String,
        latency_ms: u64,
        attempts: Vec<CallAttempt>,
    ) -> Self {
        Self {
            task,
            status: TaskStatus::Succeeded,
            confidence: payload.overall_confidence(),
            payload: Some(payload),
            model: Some(model),
            latency_ms,
            attempts,
            error: None,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    /// A payload served without invoking the provider
    pub fn cached(
        task: TaskKey,
        fingerprint: String,
        payload: TaskPayload,
        model: String,
        latency_ms: u64,
    ) -> Self {
        Self {
            task,
            status: TaskStatus::Cached,
            confidence: payload.overall_confidence(),
            payload: Some(payload),
            model: Some(model),
            latency_ms,
            attempts: Vec::new(),
            error: None,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    /// Every candidate model was exhausted
    pub fn failed(
        task: TaskKey,
        fingerprint: String,
        error: TaskError,
        latency_ms: u64,
        attempts: Vec<CallAttempt>,
    ) -> Self {
        Self {
            task,
            status: TaskStatus::Failed,
            payload: None,
            confidence: 0.0,
            model: None,
            latency_ms,
            attempts,
            error: Some(error),
            fingerprint,
            created_at: Utc::now(),
        }
    }

    /// Whether the result carries a payload dependents may use
    pub fn is_usable(&self) -> bool {
        !matches!(self.status, TaskStatus::Failed)
    }

    pub fn error_kind(&self) -> Option<InferenceErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

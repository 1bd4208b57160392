//! Inference provider interfaces.
//!
//! Providers turn a task's prompt template, model choice and inputs into a
//! structured JSON payload. The pipeline never sees prompt wording or
//! transport details, only the payload or a typed error.

pub mod openrouter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{InferenceErrorKind, PromptTemplate, TaskKey};

// Re-export the OpenRouter provider
pub use openrouter::{OpenRouterProvider, OpenRouterSettings, RateLimiter};

/// Errors a provider can report for a single call
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Network failure, throttling or provider outage
    #[error("Transport error: {0}")]
    Transport(String),

    /// The model answered, but not with a usable JSON object
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// Missing credentials, missing template or rejected configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn kind(&self) -> InferenceErrorKind {
        match self {
            ProviderError::Transport(_) => InferenceErrorKind::Transport,
            ProviderError::MalformedOutput(_) => InferenceErrorKind::Schema,
            ProviderError::Config(_) => InferenceErrorKind::FatalConfig,
        }
    }
}

/// Source facets and upstream context handed to one task
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    pub video: Option<Arc<[u8]>>,
    pub audio: Option<Arc<[u8]>>,
    pub transcript: Option<Arc<str>>,

    /// Upstream payloads keyed by stage then task, plus collapsed moments
    pub prior: Option<serde_json::Value>,
}

/// A single call against one candidate model
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub task: TaskKey,
    pub model: String,
    pub template: PromptTemplate,
    pub inputs: Arc<TaskInputs>,
}

/// Trait for inference backends
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Run one call and return the raw structured payload
    async fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value, ProviderError>;

    /// Wait until the backend can accept another call. Time spent here is
    /// not charged to the per-call timeout.
    async fn reserve(&self) {}

    /// Check credentials and templates before a run starts
    async fn preflight(&self, _templates: &[&PromptTemplate]) -> Result<(), ProviderError> {
        Ok(())
    }
}

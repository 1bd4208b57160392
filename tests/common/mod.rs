//! Shared fixtures for integration tests: a scripted inference provider,
//! a representative source and fast run limits.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use profiler::adapters::{InferenceProvider, InferenceRequest, ProviderError};
use profiler::core::{Orchestrator, RetryPolicy, RunLimits};
use profiler::domain::{PromptTemplate, Resolution, SourceArtifact};

/// Number of tasks in the built-in pipeline
pub const STANDARD_TASKS: usize = 20;

/// What the provider does for one task
#[derive(Clone)]
pub enum Behavior {
    Reply(Value),
    Fail(ProviderError),
    /// Never answers within any test timeout
    Hang,
}

/// Provider answering from a per-task script, keyed by `stage/task`
pub struct ScriptedProvider {
    rules: HashMap<String, Behavior>,
    default_reply: Value,
    delay: Duration,
    preflight_error: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            default_reply: axes(&[("emotional_valence", "positive", 0.6)]),
            delay: Duration::ZERO,
            preflight_error: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, task: &str, behavior: Behavior) -> Self {
        self.rules.insert(task.to_string(), behavior);
        self
    }

    pub fn with_default(mut self, reply: Value) -> Self {
        self.default_reply = reply;
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_preflight(mut self, message: &str) -> Self {
        self.preflight_error = Some(message.to_string());
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Every call so far, as `stage/task@model`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task: &str) -> usize {
        let prefix = format!("{}@", task);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn calls_for_stage(&self, stage: &str) -> usize {
        let prefix = format!("{}/", stage);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<Value, ProviderError> {
        let task = request.task.to_string();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}@{}", task, request.model));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.rules.get(&task) {
            Some(Behavior::Reply(value)) => Ok(value.clone()),
            Some(Behavior::Fail(error)) => Err(error.clone()),
            Some(Behavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(self.default_reply.clone())
            }
            None => Ok(self.default_reply.clone()),
        }
    }

    async fn preflight(&self, _templates: &[&PromptTemplate]) -> Result<(), ProviderError> {
        match &self.preflight_error {
            Some(message) => Err(ProviderError::Config(message.clone())),
            None => Ok(()),
        }
    }
}

/// Payload with the given `(axis, verdict, confidence)` readings
pub fn axes(readings: &[(&str, &str, f64)]) -> Value {
    let axes: serde_json::Map<String, Value> = readings
        .iter()
        .map(|(axis, verdict, confidence)| {
            (
                axis.to_string(),
                json!({"verdict": verdict, "confidence": confidence}),
            )
        })
        .collect();
    json!({ "axes": axes })
}

pub fn transport(message: &str) -> Behavior {
    Behavior::Fail(ProviderError::Transport(message.to_string()))
}

/// A one-minute interview with audio and transcript
pub fn source() -> SourceArtifact {
    SourceArtifact::new("interview", vec![7u8; 4096], 60.0, Resolution::new(1280, 720))
        .with_audio(vec![3u8; 2048])
        .with_transcript("I was at home all evening, I think. Honestly, nothing happened.")
}

/// No retries and short timeouts so failures surface quickly
pub fn fast_limits() -> RunLimits {
    RunLimits {
        call_timeout_seconds: 5,
        stage_timeout_seconds: 10,
        run_timeout_seconds: 30,
        max_concurrent_calls: 4,
        stage_retry_rounds: 0,
        retry: RetryPolicy::no_retry(),
        ..Default::default()
    }
}

pub fn orchestrator(provider: Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::builder(provider)
        .limits(fast_limits())
        .build()
        .unwrap()
}

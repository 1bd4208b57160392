//! Inference client: candidate-model fallback over a provider.
//!
//! Each task names an ordered list of candidate models. Transport errors and
//! timeouts are retried on the same model per the retry policy, invalid
//! output moves on to the next candidate, and configuration errors stop the
//! walk. Only call telemetry is logged, never payload content.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::adapters::{InferenceProvider, InferenceRequest, ProviderError, TaskInputs};
use crate::domain::{
    CallAttempt, InferenceErrorKind, PromptTemplate, TaskError, TaskKey, TaskPayload, TaskResult,
    TaskSpec,
};

use super::pipeline::RetryPolicy;

/// Provider handle plus the call policy applied to every task
#[derive(Clone)]
pub struct InferenceClient {
    provider: Arc<dyn InferenceProvider>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl InferenceClient {
    pub fn new(provider: Arc<dyn InferenceProvider>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            call_timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Check provider configuration for the given templates
    pub async fn preflight(&self, templates: &[&PromptTemplate]) -> Result<(), ProviderError> {
        self.provider.preflight(templates).await
    }

    /// Run a task against its candidate models until one yields a valid payload.
    /// Models listed in `skip` are never called.
    pub async fn invoke(
        &self,
        spec: &TaskSpec,
        key: TaskKey,
        fingerprint: String,
        inputs: Arc<TaskInputs>,
        skip: &[String],
    ) -> TaskResult {
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut last_error: Option<TaskError> = None;

        'models: for model in spec.models.iter().filter(|m| !skip.contains(*m)) {
            let request = InferenceRequest {
                task: key.clone(),
                model: model.clone(),
                template: spec.template.clone(),
                inputs: Arc::clone(&inputs),
            };
            let mut attempt = 1;

            loop {
                // Queueing for provider capacity is outside the call budget
                self.provider.reserve().await;
                let call_started = Instant::now();
                let outcome = match timeout(self.call_timeout, self.provider.infer(&request)).await {
                    Ok(Ok(value)) => parse_payload(value),
                    Ok(Err(e)) => Err(TaskError {
                        kind: e.kind(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(TaskError {
                        kind: InferenceErrorKind::Timeout,
                        message: format!("Call exceeded {:?}", self.call_timeout),
                    }),
                };
                let latency_ms = call_started.elapsed().as_millis() as u64;

                let error = match outcome {
                    Ok(payload) => {
                        attempts.push(CallAttempt {
                            model: model.clone(),
                            latency_ms,
                            error: None,
                        });
                        debug!(task = %key, model = %model, latency_ms, "Inference call succeeded");
                        return TaskResult::succeeded(
                            key,
                            fingerprint,
                            payload,
                            model.clone(),
                            started.elapsed().as_millis() as u64,
                            attempts,
                        );
                    }
                    Err(error) => error,
                };

                attempts.push(CallAttempt {
                    model: model.clone(),
                    latency_ms,
                    error: Some(error.kind),
                });
                warn!(
                    task = %key,
                    model = %model,
                    latency_ms,
                    kind = %error.kind,
                    attempt,
                    "Inference call failed"
                );

                let kind = error.kind;
                last_error = Some(error);

                match kind {
                    InferenceErrorKind::FatalConfig => break 'models,
                    InferenceErrorKind::Schema => continue 'models,
                    InferenceErrorKind::Transport | InferenceErrorKind::Timeout => {
                        if !self.retry.should_retry(attempt) {
                            continue 'models;
                        }
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| TaskError {
            kind: InferenceErrorKind::FatalConfig,
            message: "Task has no candidate models".to_string(),
        });

        TaskResult::failed(
            key,
            fingerprint,
            error,
            started.elapsed().as_millis() as u64,
            attempts,
        )
    }
}

/// Decode and validate a raw provider payload
pub fn parse_payload(value: serde_json::Value) -> Result<TaskPayload, TaskError> {
    let payload: TaskPayload = serde_json::from_value(value).map_err(|e| TaskError {
        kind: InferenceErrorKind::Schema,
        message: format!("Payload does not match schema: {}", e),
    })?;

    payload.validate().map_err(|message| TaskError {
        kind: InferenceErrorKind::Schema,
        message,
    })?;

    Ok(payload)
}

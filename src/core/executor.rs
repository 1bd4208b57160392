//! Stage execution: every task of a stage runs concurrently, deduplicated
//! through the result cache and bounded by a shared semaphore.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::adapters::TaskInputs;
use crate::domain::{
    CorroboratedMoment, Facet, InferenceErrorKind, SourceArtifact, StageId, StageOutput, TaskError,
    TaskKey, TaskResult, TaskSpec,
};

use super::cache::{ResultCache, Ticket};
use super::inference::InferenceClient;
use super::pipeline::{RetryPolicy, StageSpec};

/// Read-only context a stage runs against
#[derive(Debug, Clone)]
pub struct StageInputs {
    pub source: SourceArtifact,

    /// Outputs of every ancestor stage
    pub prior: BTreeMap<StageId, StageOutput>,

    /// Corroborated moments from upstream evidence (synthesis only)
    pub moments: Vec<CorroboratedMoment>,
}

impl StageInputs {
    pub fn new(source: SourceArtifact) -> Self {
        Self {
            source,
            prior: BTreeMap::new(),
            moments: Vec::new(),
        }
    }

    /// Upstream stages that lost work
    pub fn degraded_upstream(&self) -> Vec<StageId> {
        self.prior
            .values()
            .filter(|o| o.status == crate::domain::StageStatus::Degraded)
            .map(|o| o.stage)
            .collect()
    }

    /// Prior context as passed to providers: usable payloads only
    pub fn prior_context(&self) -> serde_json::Value {
        let stages: BTreeMap<&str, BTreeMap<&str, &crate::domain::TaskPayload>> = self
            .prior
            .iter()
            .map(|(stage, output)| (stage.as_str(), output.payloads()))
            .collect();

        let mut context = json!({
            "stages": stages,
            "degraded": self.degraded_upstream(),
        });
        if !self.moments.is_empty() {
            context["moments"] = json!(self.moments);
        }
        context
    }
}

/// Deterministic identity of one unit of work.
///
/// Covers the source content, template identity, candidate models, facets
/// and the digest of whatever prior context the task consumes.
pub fn fingerprint(content_hash: &str, spec: &TaskSpec, prior: Option<&serde_json::Value>) -> String {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(content_hash.as_bytes());
    field(spec.template.id.as_bytes());
    field(&spec.template.version.to_le_bytes());
    for model in &spec.models {
        field(model.as_bytes());
    }
    let mut facets = spec.facets.clone();
    facets.sort();
    facets.dedup();
    for facet in facets {
        field(&[facet as u8]);
    }
    match prior {
        Some(context) => {
            let digest = Sha256::digest(context.to_string().as_bytes());
            field(&digest);
        }
        None => field(b"-"),
    }

    hex::encode(hasher.finalize())
}

/// Runs stages against an inference client and a shared cache
#[derive(Clone)]
pub struct TaskExecutor {
    client: InferenceClient,
    cache: ResultCache,
    permits: Arc<Semaphore>,
    retry_rounds: u32,
    round_backoff: RetryPolicy,
}

impl TaskExecutor {
    pub fn new(
        client: InferenceClient,
        cache: ResultCache,
        max_concurrent_calls: usize,
        retry_rounds: u32,
        round_backoff: RetryPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            retry_rounds,
            round_backoff,
        }
    }

    pub fn client(&self) -> &InferenceClient {
        &self.client
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Execute every task of a stage and classify the outcome
    pub async fn run_stage(&self, spec: &StageSpec, inputs: &StageInputs) -> StageOutput {
        let started_at = Utc::now();
        let prior = spec
            .tasks
            .iter()
            .any(|t| t.uses(Facet::Prior))
            .then(|| Arc::new(inputs.prior_context()));

        let first_pass = join_all(
            spec.tasks
                .iter()
                .map(|task| self.run_task(spec.id, task, inputs, prior.clone(), &[])),
        )
        .await;

        let mut results: BTreeMap<String, TaskResult> = first_pass
            .into_iter()
            .map(|r| (r.task.name.clone(), r))
            .collect();
        let mut superseded = Vec::new();
        // Models that returned invalid output, per task; never asked again
        let mut invalid: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for round in 1..=self.retry_rounds {
            for result in results.values() {
                let models = invalid.entry(result.task.name.clone()).or_default();
                for model in schema_failed_models(result) {
                    if !models.contains(&model) {
                        models.push(model);
                    }
                }
            }

            let retryable: Vec<(&TaskSpec, &[String])> = spec
                .tasks
                .iter()
                .filter_map(|t| {
                    let result = results.get(&t.name)?;
                    if result.is_usable()
                        || result.error_kind() == Some(InferenceErrorKind::FatalConfig)
                    {
                        return None;
                    }
                    let skip = invalid.get(&t.name).map(Vec::as_slice).unwrap_or(&[]);
                    t.models
                        .iter()
                        .any(|m| !skip.contains(m))
                        .then_some((t, skip))
                })
                .collect();
            if retryable.is_empty() {
                break;
            }

            info!(
                stage = %spec.id,
                round,
                tasks = retryable.len(),
                "Retrying failed tasks"
            );
            tokio::time::sleep(self.round_backoff.delay_for_attempt(round)).await;

            let rerun = join_all(
                retryable
                    .iter()
                    .map(|(task, skip)| self.run_task(spec.id, task, inputs, prior.clone(), skip)),
            )
            .await;

            for result in rerun {
                if let Some(previous) = results.insert(result.task.name.clone(), result) {
                    superseded.push(previous);
                }
            }
        }

        let status = spec.evaluate(&results);
        StageOutput {
            stage: spec.id,
            status,
            results,
            superseded,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_task(
        &self,
        stage: StageId,
        spec: &TaskSpec,
        inputs: &StageInputs,
        prior: Option<Arc<serde_json::Value>>,
        skip: &[String],
    ) -> TaskResult {
        let key = TaskKey::new(stage, spec.name.clone());
        let prior = prior.filter(|_| spec.uses(Facet::Prior));
        let fp = fingerprint(inputs.source.content_hash(), spec, prior.as_deref());
        let task_inputs = Arc::new(task_inputs(&inputs.source, spec, prior.as_deref()));

        loop {
            match self.cache.dedupe(&fp) {
                Ticket::Hit(entry) => {
                    debug!(task = %key, fingerprint = %fp, "Cache hit");
                    return TaskResult::cached(key, fp, entry.payload, entry.model_id, 0);
                }
                Ticket::Owner(guard) => {
                    debug!(task = %key, fingerprint = %guard.fingerprint(), "Computing");
                    let result = {
                        // The semaphore is never closed
                        let _permit = self.permits.acquire().await.ok();
                        self.client
                            .invoke(spec, key.clone(), fp.clone(), Arc::clone(&task_inputs), skip)
                            .await
                    };
                    guard.complete(&result).await;
                    return result;
                }
                Ticket::Waiter(waiter) => {
                    let started = Instant::now();
                    debug!(task = %key, fingerprint = %fp, "Joining in-flight computation");
                    if let Some(outcome) = waiter.wait().await {
                        return adopt(outcome, key, fp, started.elapsed());
                    }
                    debug!(task = %key, "In-flight owner abandoned; contending again");
                }
            }
        }
    }
}

/// Candidates whose output failed validation in this result
fn schema_failed_models(result: &TaskResult) -> impl Iterator<Item = String> + '_ {
    result
        .attempts
        .iter()
        .filter(|a| a.error == Some(InferenceErrorKind::Schema))
        .map(|a| a.model.clone())
}

/// Rebind another caller's outcome to this task
fn adopt(outcome: TaskResult, key: TaskKey, fingerprint: String, waited: Duration) -> TaskResult {
    let latency_ms = waited.as_millis() as u64;
    let usable = outcome.is_usable();
    match (outcome.payload, outcome.model) {
        (Some(payload), Some(model)) if usable => {
            TaskResult::cached(key, fingerprint, payload, model, latency_ms)
        }
        _ => TaskResult::failed(
            key,
            fingerprint,
            outcome.error.unwrap_or(TaskError {
                kind: InferenceErrorKind::Transport,
                message: "Shared computation failed".to_string(),
            }),
            latency_ms,
            Vec::new(),
        ),
    }
}

fn task_inputs(
    source: &SourceArtifact,
    spec: &TaskSpec,
    prior: Option<&serde_json::Value>,
) -> TaskInputs {
    TaskInputs {
        video: spec.uses(Facet::Video).then(|| Arc::clone(source.video())),
        audio: if spec.uses(Facet::Audio) {
            source.audio().cloned()
        } else {
            None
        },
        transcript: if spec.uses(Facet::Transcript) {
            source.transcript().map(Arc::from)
        } else {
            None
        },
        prior: prior.cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InferenceProvider, InferenceRequest, ProviderError};
    use crate::domain::{PromptTemplate, Resolution, StageStatus, TaskRole, TaskStatus};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts calls and peak concurrency; fails a task's first N calls
    #[derive(Default)]
    struct Counting {
        fail_first: Mutex<HashMap<String, u32>>,
        /// `task@model` pairs that answer with an empty axis map
        invalid: Mutex<HashSet<String>>,
        seen: Mutex<Vec<String>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl InferenceProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = format!("{}@{}", request.task.name, request.model);
            self.seen.lock().unwrap().push(call.clone());
            if self.invalid.lock().unwrap().contains(&call) {
                return Ok(json!({"axes": {}}));
            }

            let mut failures = self.fail_first.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&request.task.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Transport("503".into()));
                }
            }
            Ok(json!({"axes": {"threat": {"verdict": "low", "confidence": 0.6}}}))
        }
    }

    fn executor(provider: Arc<Counting>, max_concurrent: usize, rounds: u32) -> TaskExecutor {
        let client = InferenceClient::new(provider, RetryPolicy::no_retry(), Duration::from_secs(5));
        let backoff = RetryPolicy {
            initial_delay_ms: 1,
            ..RetryPolicy::no_retry()
        };
        TaskExecutor::new(client, ResultCache::in_memory(), max_concurrent, rounds, backoff)
    }

    fn video_stage(names: &[&str]) -> StageSpec {
        StageSpec {
            id: StageId::Video,
            predecessors: vec![],
            tasks: names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let role = if i == 0 { TaskRole::Required } else { TaskRole::Optional };
                    TaskSpec::new(*name, PromptTemplate::new(*name, 1), &[Facet::Video], &["m1", "m2"], role)
                })
                .collect(),
        }
    }

    fn spec(models: &[&str]) -> TaskSpec {
        TaskSpec::new(
            "kinesic_log",
            PromptTemplate::new("kinesic_log", 1),
            &[Facet::Video, Facet::Prior],
            models,
            TaskRole::Required,
        )
    }

    fn source() -> SourceArtifact {
        SourceArtifact::new("clip", vec![1, 2, 3], 30.0, Resolution::new(640, 480))
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let prior = json!({"stages": {"audio": {}}});
        let a = fingerprint("hash", &spec(&["m1", "m2"]), Some(&prior));
        let b = fingerprint("hash", &spec(&["m1", "m2"]), Some(&prior));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_every_input() {
        let prior = json!({"stages": {"audio": {}}});
        let base = fingerprint("hash", &spec(&["m1", "m2"]), Some(&prior));

        assert_ne!(base, fingerprint("other", &spec(&["m1", "m2"]), Some(&prior)));
        assert_ne!(base, fingerprint("hash", &spec(&["m2", "m1"]), Some(&prior)));
        assert_ne!(base, fingerprint("hash", &spec(&["m1", "m2"]), None));
        assert_ne!(
            base,
            fingerprint("hash", &spec(&["m1", "m2"]), Some(&json!({"stages": {}})))
        );

        let mut bumped = spec(&["m1", "m2"]);
        bumped.template.version = 2;
        assert_ne!(base, fingerprint("hash", &bumped, Some(&prior)));
    }

    #[test]
    fn test_task_inputs_follow_facets() {
        let source = source().with_transcript("hello");
        let inputs = task_inputs(&source, &spec(&["m"]), Some(&json!({})));

        assert!(inputs.video.is_some());
        assert!(inputs.audio.is_none());
        assert!(inputs.transcript.is_none());
        assert!(inputs.prior.is_some());
    }

    #[test]
    fn test_prior_context_skips_unusable_payloads() {
        let inputs = StageInputs::new(source());
        let context = inputs.prior_context();

        assert_eq!(context["stages"], json!({}));
        assert_eq!(context["degraded"], json!([]));
        assert!(context.get("moments").is_none());
    }

    #[tokio::test]
    async fn test_retry_round_supersedes_failed_attempt() {
        let provider = Arc::new(Counting::default());
        provider
            .fail_first
            .lock()
            .unwrap()
            .insert("subject_identification".to_string(), 2);
        let exec = executor(provider.clone(), 4, 1);

        let output = exec
            .run_stage(&video_stage(&["subject_identification", "baseline"]), &StageInputs::new(source()))
            .await;

        assert_eq!(output.status, StageStatus::Succeeded);
        assert_eq!(output.results["subject_identification"].status, TaskStatus::Succeeded);
        assert_eq!(output.superseded.len(), 1);
        assert_eq!(output.superseded[0].status, TaskStatus::Failed);
        // Two failed candidates, then one success in the retry round, plus baseline
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    impl Counting {
        fn calls_to(&self, call: &str) -> usize {
            self.seen.lock().unwrap().iter().filter(|c| *c == call).count()
        }
    }

    #[tokio::test]
    async fn test_retry_round_skips_models_with_invalid_output() {
        let provider = Arc::new(Counting::default());
        provider.invalid.lock().unwrap().insert("baseline@m1".to_string());
        provider.fail_first.lock().unwrap().insert("baseline".to_string(), 1);
        let exec = executor(provider.clone(), 4, 2);

        let output = exec
            .run_stage(&video_stage(&["subject_identification", "baseline"]), &StageInputs::new(source()))
            .await;

        assert_eq!(output.status, StageStatus::Succeeded);
        assert_eq!(output.results["baseline"].model.as_deref(), Some("m2"));
        assert_eq!(output.superseded.len(), 1);
        assert_eq!(provider.calls_to("baseline@m1"), 1);
        assert_eq!(provider.calls_to("baseline@m2"), 2);
    }

    #[tokio::test]
    async fn test_task_with_only_invalid_output_is_not_retried() {
        let provider = Arc::new(Counting::default());
        {
            let mut invalid = provider.invalid.lock().unwrap();
            invalid.insert("baseline@m1".to_string());
            invalid.insert("baseline@m2".to_string());
        }
        let exec = executor(provider.clone(), 4, 1);

        let output = exec
            .run_stage(&video_stage(&["subject_identification", "baseline"]), &StageInputs::new(source()))
            .await;

        assert_eq!(output.status, StageStatus::Degraded);
        assert_eq!(
            output.results["baseline"].error_kind(),
            Some(InferenceErrorKind::Schema)
        );
        assert!(output.superseded.is_empty());
        assert_eq!(provider.calls_to("baseline@m1"), 1);
        assert_eq!(provider.calls_to("baseline@m2"), 1);
    }

    #[tokio::test]
    async fn test_without_retry_rounds_failure_stands() {
        let provider = Arc::new(Counting::default());
        provider
            .fail_first
            .lock()
            .unwrap()
            .insert("baseline".to_string(), 2);
        let exec = executor(provider, 4, 0);

        let output = exec
            .run_stage(&video_stage(&["subject_identification", "baseline"]), &StageInputs::new(source()))
            .await;

        assert_eq!(output.status, StageStatus::Degraded);
        assert_eq!(output.failed_tasks(), vec!["baseline"]);
        assert!(output.superseded.is_empty());
    }

    #[tokio::test]
    async fn test_identical_concurrent_stages_share_calls() {
        let provider = Arc::new(Counting {
            delay_ms: 20,
            ..Default::default()
        });
        let exec = executor(provider.clone(), 4, 0);
        let stage = video_stage(&["subject_identification", "baseline"]);
        let inputs = StageInputs::new(source());

        let (a, b) = tokio::join!(exec.run_stage(&stage, &inputs), exec.run_stage(&stage, &inputs));

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        for name in ["subject_identification", "baseline"] {
            assert_eq!(a.results[name].payload, b.results[name].payload);
            let statuses = [a.results[name].status, b.results[name].status];
            assert!(statuses.contains(&TaskStatus::Succeeded));
            assert!(statuses.contains(&TaskStatus::Cached));
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let provider = Arc::new(Counting {
            delay_ms: 20,
            ..Default::default()
        });
        let exec = executor(provider.clone(), 2, 0);

        let output = exec
            .run_stage(&video_stage(&["a", "b", "c", "d", "e"]), &StageInputs::new(source()))
            .await;

        assert_eq!(output.status, StageStatus::Succeeded);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }
}

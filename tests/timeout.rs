//! Timeout and Cancellation Integration Tests
//!
//! Run and stage time budgets, caller cancellation and progress reporting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_limits, orchestrator, source, Behavior, ScriptedProvider};
use profiler::core::{Orchestrator, PipelineError, RunLimits, RunResult};
use profiler::domain::{InferenceErrorKind, RunFailureKind, RunProgress, RunState, StageId, StageStatus};
use tokio::sync::watch;

fn hanging_subject() -> Arc<ScriptedProvider> {
    ScriptedProvider::new()
        .on("video/subject_identification", Behavior::Hang)
        .build()
}

fn with_limits(provider: Arc<ScriptedProvider>, limits: RunLimits) -> Orchestrator {
    Orchestrator::builder(provider).limits(limits).build().unwrap()
}

/// Wait until the run reports a terminal state
async fn until_terminal(mut rx: watch::Receiver<RunProgress>) -> RunProgress {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !rx.borrow().state.is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        rx.borrow().clone()
    })
    .await
    .expect("run did not finish")
}

#[tokio::test]
async fn test_run_timeout_fails_run() {
    let limits = RunLimits {
        run_timeout_seconds: 1,
        call_timeout_seconds: 30,
        stage_timeout_seconds: 30,
        ..fast_limits()
    };
    let orch = with_limits(hanging_subject(), limits);

    let run = orch.execute(source(), None).await.unwrap();

    match &run.state {
        RunState::Failed { kind, .. } => assert_eq!(*kind, RunFailureKind::Timeout),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(matches!(
        PipelineError::from_run(&run),
        Some(PipelineError::Timeout(_))
    ));
    // The in-flight stage is abandoned, the rest never start
    assert!(run.stages.values().all(|s| *s == StageStatus::Skipped));
    assert!(run.profile.as_ref().unwrap().partial);
}

#[tokio::test]
async fn test_stage_timeout_fails_stage() {
    let limits = RunLimits {
        stage_timeout_seconds: 1,
        call_timeout_seconds: 30,
        run_timeout_seconds: 30,
        ..fast_limits()
    };
    let provider = hanging_subject();
    let orch = with_limits(provider.clone(), limits);

    let run = orch.execute(source(), None).await.unwrap();

    match &run.state {
        RunState::Failed { kind, stage, .. } => {
            assert_eq!(*kind, RunFailureKind::StageFailed);
            assert_eq!(*stage, Some(StageId::Video));
        }
        other => panic!("expected stage failure, got {:?}", other),
    }
    assert_eq!(run.stages[&StageId::Video], StageStatus::Failed);
    assert_eq!(run.stages[&StageId::Audio], StageStatus::Skipped);
    assert!(run
        .failures
        .iter()
        .any(|n| n.stage == StageId::Video && n.kind == Some(InferenceErrorKind::Timeout)));
    assert_eq!(provider.calls_for_stage("audio"), 0);
}

#[tokio::test]
async fn test_call_timeout_moves_to_next_model() {
    let limits = RunLimits {
        call_timeout_seconds: 1,
        ..fast_limits()
    };
    let provider = ScriptedProvider::new()
        .on("video/deepfake_detection", Behavior::Hang)
        .build();
    let orch = with_limits(provider.clone(), limits);

    let run = orch.execute(source(), None).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.stages[&StageId::Video], StageStatus::Degraded);
    assert_eq!(provider.calls_for("video/deepfake_detection"), 2);
    let result = &run.outputs[&StageId::Video].results["deepfake_detection"];
    assert_eq!(result.error_kind(), Some(InferenceErrorKind::Timeout));
}

#[tokio::test]
async fn test_cancel_run() {
    let provider = hanging_subject();
    let orch = orchestrator(provider.clone());

    let run_id = orch.start_run(source(), None).unwrap();
    let rx = orch.subscribe(run_id).unwrap();

    // Let the first stage start
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(orch.get_result(run_id).unwrap(), RunResult::InProgress(_)));
    assert!(orch.cancel_run(run_id).unwrap());

    let progress = until_terminal(rx).await;
    assert_eq!(progress.state, RunState::Cancelled);

    let run = match orch.get_result(run_id).unwrap() {
        RunResult::Finished(run) => run,
        RunResult::InProgress(p) => panic!("still running: {:?}", p),
    };
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.stages[&StageId::Video], StageStatus::Skipped);
    assert!(run
        .failures
        .iter()
        .any(|n| n.stage == StageId::Video && n.message.contains("cancelled")));
    assert_eq!(provider.calls_for_stage("audio"), 0);

    // Cancelling a finished run is a no-op
    assert!(!orch.cancel_run(run_id).unwrap());
}

#[tokio::test]
async fn test_progress_reaches_every_stage() {
    let provider = ScriptedProvider::new()
        .with_delay(Duration::from_millis(5))
        .build();
    let orch = orchestrator(provider);

    let run_id = orch.start_run(source(), None).unwrap();
    let progress = until_terminal(orch.subscribe(run_id).unwrap()).await;

    assert_eq!(progress.state, RunState::Completed);
    assert_eq!(progress.completed, progress.total);
    assert_eq!(progress.total, 6);
    assert!(progress.running.is_empty());
    assert_eq!(progress.fraction(), 1.0);
    assert_eq!(orch.get_progress(run_id).unwrap(), progress);
}

#[tokio::test]
async fn test_unknown_run_is_an_error() {
    let orch = orchestrator(ScriptedProvider::new().build());
    let missing = uuid::Uuid::new_v4();

    assert!(matches!(
        orch.get_result(missing),
        Err(PipelineError::UnknownRun(id)) if id == missing
    ));
    assert!(orch.cancel_run(missing).is_err());
}

#[tokio::test]
async fn test_forget_run_releases_only_finished_runs() {
    let provider = hanging_subject();
    let orch = orchestrator(provider);

    let run_id = orch.start_run(source(), None).unwrap();
    let rx = orch.subscribe(run_id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(orch.forget_run(run_id).unwrap().is_none());
    assert!(orch.get_progress(run_id).is_ok());

    orch.cancel_run(run_id).unwrap();
    until_terminal(rx).await;

    let run = orch.forget_run(run_id).unwrap().expect("finished run");
    assert_eq!(run.state, RunState::Cancelled);
    assert!(matches!(
        orch.get_result(run_id),
        Err(PipelineError::UnknownRun(_))
    ));
}

#[tokio::test]
async fn test_execute_does_not_retain_runs() {
    let orch = orchestrator(ScriptedProvider::new().build());

    let run = orch.execute(source(), None).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert!(orch.get_progress(run.id).is_err());
}

//! Event Store Integration Tests
//!
//! Tests for event log format, append and replay order, run records, and
//! the store acting as the orchestrator's sink.

mod common;

use std::sync::Arc;

use common::{fast_limits, source, transport, ScriptedProvider, STANDARD_TASKS};
use profiler::core::{EventStore, Orchestrator};
use profiler::domain::{Event, EventType, RunState, StageId, StageStatus};
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn test_event_append_format() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path().join("runs"));
    let run_id = Uuid::new_v4();

    let event = Event::task(
        run_id,
        StageId::Visual,
        "kinesic_log",
        EventType::TaskSucceeded,
        "Task 'kinesic_log' succeeded",
    )
    .with_duration(1500)
    .with_fingerprint("ab".repeat(32));
    store.append(&event).await.unwrap();

    let raw = tokio::fs::read_to_string(store.events_path(run_id))
        .await
        .unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 1);

    let parsed: Event = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(parsed.run_id, run_id);
    assert_eq!(parsed.stage, Some(StageId::Visual));
    assert_eq!(parsed.task.as_deref(), Some("kinesic_log"));
    assert_eq!(parsed.event_type, EventType::TaskSucceeded);
    assert_eq!(parsed.duration_ms, Some(1500));
    assert_eq!(parsed.fingerprint.as_deref().map(str::len), Some(64));

    // Verify timestamp is valid ISO 8601
    assert!(parsed.timestamp.to_rfc3339().contains('T'));
}

#[tokio::test]
async fn test_event_replay_order() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path());
    let run_id = Uuid::new_v4();

    store
        .append(&Event::run(run_id, EventType::RunStarted, "started"))
        .await
        .unwrap();
    for stage in [StageId::Video, StageId::Audio] {
        store
            .append(&Event::stage(
                run_id,
                stage,
                EventType::StageCompleted,
                StageStatus::Succeeded,
                "done",
            ))
            .await
            .unwrap();
    }
    store
        .append(
            &Event::run(run_id, EventType::RunFailed, "failed")
                .with_error("Stage 'visual' failed".to_string()),
        )
        .await
        .unwrap();

    let events = store.replay(run_id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::RunStarted,
            EventType::StageCompleted,
            EventType::StageCompleted,
            EventType::RunFailed,
        ]
    );
    assert_eq!(events[1].stage, Some(StageId::Video));
    assert_eq!(events[2].stage, Some(StageId::Audio));

    let last = store
        .last_event_of_type(run_id, EventType::StageCompleted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.stage, Some(StageId::Audio));

    // Unknown runs replay as empty
    assert!(store.replay(Uuid::new_v4()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_records_orchestrated_run() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::new(temp.path().join("runs"));
    let provider = ScriptedProvider::new()
        .on("voice/minimizing_language", transport("503"))
        .build();
    let orch = Orchestrator::builder(provider)
        .limits(fast_limits())
        .sink(Arc::new(store.clone()))
        .build()
        .unwrap();

    let run = orch.execute(source(), None).await.unwrap();
    assert_eq!(run.state, RunState::Completed);

    let events = store.replay(run.id).await.unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::RunStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::RunCompleted);

    let timeline = store.timeline(run.id).await.unwrap().unwrap();
    assert_eq!(timeline.state, RunState::Completed);
    assert_eq!(timeline.stages[&StageId::Voice], StageStatus::Degraded);
    assert_eq!(timeline.tasks_failed, 1);
    assert_eq!(timeline.tasks_succeeded, STANDARD_TASKS - 1);

    let failed = store
        .find_events(run.id, |e| e.event_type == EventType::TaskFailed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task.as_deref(), Some("minimizing_language"));
    assert!(failed[0].error.is_some());

    let saved = store.load_run(run.id).await.unwrap().unwrap();
    assert_eq!(saved.state, RunState::Completed);
    assert_eq!(saved.stages, run.stages);
    assert_eq!(saved.profile, run.profile);
    assert_eq!(store.list_runs().await.unwrap(), vec![run.id]);

    // Media bytes never reach the run record
    let raw = tokio::fs::read_to_string(store.run_dir(run.id).join("run.json"))
        .await
        .unwrap();
    assert!(raw.contains(&run.source.content_hash));
    assert!(!raw.contains("I was at home all evening"));
}

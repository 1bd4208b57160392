//! Safety Limits Integration Tests
//!
//! Tests for source admission and run limit validation.

mod common;

use common::{fast_limits, ScriptedProvider};
use profiler::core::{Orchestrator, PipelineError, RunLimits, SafetyViolation, SourceLimits};
use profiler::domain::{Resolution, SourceArtifact};

fn clip(duration: f64, bytes: usize) -> SourceArtifact {
    SourceArtifact::new("clip", vec![1u8; bytes], duration, Resolution::new(1280, 720))
}

#[test]
fn test_source_duration_bounds() {
    let limits = SourceLimits::default();

    assert!(limits.validate(&clip(10.0, 16)).is_ok());
    assert!(limits.validate(&clip(300.0, 16)).is_ok());

    match limits.validate(&clip(9.5, 16)) {
        Err(SafetyViolation::TooShort { actual, limit }) => {
            assert_eq!(actual, 9.5);
            assert_eq!(limit, 10.0);
        }
        other => panic!("Expected TooShort violation, got {:?}", other),
    }
    assert!(matches!(
        limits.validate(&clip(301.0, 16)),
        Err(SafetyViolation::TooLong { .. })
    ));
}

#[test]
fn test_source_size_bound() {
    let limits = SourceLimits {
        max_source_bytes: 100,
        ..Default::default()
    };

    assert!(limits.validate(&clip(30.0, 100)).is_ok());
    match limits.validate(&clip(30.0, 200)) {
        Err(SafetyViolation::MaxSourceBytes { actual, limit }) => {
            assert_eq!(actual, 200);
            assert_eq!(limit, 100);
        }
        other => panic!("Expected MaxSourceBytes violation, got {:?}", other),
    }
    assert!(matches!(
        limits.validate(&clip(30.0, 0)),
        Err(SafetyViolation::EmptySource)
    ));
}

#[test]
fn test_limits_from_yaml() {
    let yaml = r#"
call_timeout_seconds: 45
max_concurrent_calls: 8
retry:
  max_attempts: 3
source:
  max_duration_seconds: 600
"#;

    let limits: RunLimits = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(limits.call_timeout_seconds, 45);
    assert_eq!(limits.max_concurrent_calls, 8);
    assert_eq!(limits.retry.max_attempts, 3);
    assert_eq!(limits.source.max_duration_seconds, 600.0);
    assert_eq!(limits.source.min_duration_seconds, 10.0);
    assert_eq!(limits.stage_timeout_seconds, 300);
    assert!(limits.validate().is_ok());
}

#[test]
fn test_builder_rejects_invalid_limits() {
    let limits = RunLimits {
        max_concurrent_calls: 0,
        ..fast_limits()
    };

    let result = Orchestrator::builder(ScriptedProvider::new().build())
        .limits(limits)
        .build();

    assert!(matches!(
        result,
        Err(PipelineError::InvalidLimits(SafetyViolation::InvalidLimit(_)))
    ));
}

#[tokio::test]
async fn test_oversized_source_never_reaches_provider() {
    let provider = ScriptedProvider::new().build();
    let limits = RunLimits {
        source: SourceLimits {
            max_source_bytes: 1024,
            ..Default::default()
        },
        ..fast_limits()
    };
    let orch = Orchestrator::builder(provider.clone())
        .limits(limits)
        .build()
        .unwrap();

    let err = orch.execute(clip(60.0, 4096), None).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::InvalidSource(SafetyViolation::MaxSourceBytes { .. })
    ));
    assert_eq!(provider.total_calls(), 0);
}

// Copyright (c) 2025 - Cowboy AI, LLC.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use test_case::test_case;

use common::{BrokenStage, EmbeddedAssessor, FixedStage, FlakyStage, SlowStage};
use prompt_pipeline::{
    CatchPolicy, CompositionEngine, CompositionNode, CompositionSpec, PipelineError,
    PipelineModifiers, PipelineStatus, Task,
};

fn engine() -> CompositionEngine {
    CompositionEngine::new(Arc::new(EmbeddedAssessor))
}

fn failing_then_good(catch: CatchPolicy, substitute: Option<Value>) -> CompositionSpec {
    CompositionSpec::new(CompositionNode::Sequence {
        children: vec![
            CompositionNode::Stage {
                name: "broken".into(),
                catch: Some(catch),
                substitute,
            },
            CompositionNode::stage("good"),
        ],
    })
}

#[tokio::test]
async fn halt_propagates_the_failure_to_the_root() {
    let engine = engine()
        .with_stage("broken", Arc::new(BrokenStage))
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)));

    let err = engine
        .evaluate(
            &Task::new("fragile"),
            &failing_then_good(CatchPolicy::Halt, None),
            Value::Null,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StageExecution { .. }));
}

#[tokio::test]
async fn log_continues_with_zero_quality() {
    let engine = engine()
        .with_stage("broken", Arc::new(BrokenStage))
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)));

    let result = engine
        .evaluate(
            &Task::new("fragile"),
            &failing_then_good(CatchPolicy::Log, None),
            json!({"q": 0.4}),
        )
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    // the logged stage drags the sequence minimum to zero
    assert_eq!(result.quality.aggregate, 0.0);
    // downstream stage still ran on the threaded-through input
    assert_eq!(result.value, json!({"q": 0.9}));
}

#[tokio::test]
async fn skip_omits_the_stage_from_the_quality_formula() {
    let engine = engine()
        .with_stage("broken", Arc::new(BrokenStage))
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)));

    let result = engine
        .evaluate(
            &Task::new("fragile"),
            &failing_then_good(CatchPolicy::Skip, None),
            Value::Null,
        )
        .await
        .unwrap();

    // only the surviving stage contributes
    assert!((result.quality.aggregate - 0.9).abs() < 1e-9);
    assert_eq!(result.value, json!({"q": 0.9}));
}

#[tokio::test]
async fn substitute_uses_the_caller_provided_fallback() {
    let engine = engine()
        .with_stage("broken", Arc::new(BrokenStage))
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)));

    let result = engine
        .evaluate(
            &Task::new("fragile"),
            &failing_then_good(CatchPolicy::Substitute, Some(json!({"q": 0.6}))),
            Value::Null,
        )
        .await
        .unwrap();

    // the substitute is assessed like any other output
    assert!((result.quality.aggregate - 0.6).abs() < 1e-9);
    assert_eq!(result.value, json!({"q": 0.9}));
}

#[test_case(3, 2 ; "two transient failures within three attempts")]
#[test_case(5, 4 ; "four transient failures within five attempts")]
#[tokio::test]
async fn retry_recovers_from_transient_failures(attempts: u32, failures: u32) {
    let engine = engine().with_stage("flaky", Arc::new(FlakyStage::new(failures, 0.9, 10)));
    let spec = CompositionSpec::new(CompositionNode::Stage {
        name: "flaky".into(),
        catch: Some(CatchPolicy::Retry(attempts)),
        substitute: None,
    });

    let result = engine
        .evaluate(&Task::new("flaky"), &spec, Value::Null)
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::Completed);
    assert!((result.quality.aggregate - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn retry_exhaustion_propagates_the_last_failure() {
    let engine = engine().with_stage("flaky", Arc::new(FlakyStage::new(5, 0.9, 10)));
    let spec = CompositionSpec::new(CompositionNode::Stage {
        name: "flaky".into(),
        catch: Some(CatchPolicy::Retry(2)),
        substitute: None,
    });

    let err = engine
        .evaluate(&Task::new("flaky"), &spec, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StageExecution { .. }));
}

#[tokio::test]
async fn tensor_fails_when_any_branch_fails() {
    let engine = engine()
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)))
        .with_stage("broken", Arc::new(BrokenStage));
    let spec = CompositionSpec::new(CompositionNode::Tensor {
        children: vec![
            CompositionNode::stage("good"),
            CompositionNode::stage("broken"),
        ],
    });

    let err = engine
        .evaluate(&Task::new("joint"), &spec, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StageExecution { .. }));
}

#[tokio::test]
async fn timed_out_branch_is_excluded_from_the_parallel_mean() {
    let engine = engine()
        .with_stage("fast", Arc::new(FixedStage::new(0.8, 10)))
        .with_stage("slow", Arc::new(SlowStage::new(500, 0.2, 10)));
    let spec = CompositionSpec::new(CompositionNode::Parallel {
        children: vec![
            CompositionNode::stage("fast"),
            CompositionNode::stage("slow"),
        ],
    })
    .with_modifiers(PipelineModifiers {
        branch_timeout_ms: Some(50),
        ..PipelineModifiers::default()
    });

    let result = engine
        .evaluate(&Task::new("race"), &spec, Value::Null)
        .await
        .unwrap();

    // only the fast branch contributes to the mean
    assert!((result.quality.aggregate - 0.8).abs() < 1e-9);
    assert_eq!(result.value["branches"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn too_few_surviving_branches_is_a_merge_conflict() {
    let engine = engine()
        .with_stage("fast", Arc::new(FixedStage::new(0.8, 10)))
        .with_stage("slow-a", Arc::new(SlowStage::new(500, 0.5, 10)))
        .with_stage("slow-b", Arc::new(SlowStage::new(500, 0.5, 10)));
    let spec = CompositionSpec::new(CompositionNode::Parallel {
        children: vec![
            CompositionNode::stage("fast"),
            CompositionNode::stage("slow-a"),
            CompositionNode::stage("slow-b"),
        ],
    })
    .with_modifiers(PipelineModifiers {
        branch_timeout_ms: Some(50),
        min_parallel_branches: 2,
        ..PipelineModifiers::default()
    });

    let err = engine
        .evaluate(&Task::new("race"), &spec, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MergeConflict(_)));
}

#[tokio::test]
async fn tensor_fails_on_branch_timeout() {
    let engine = engine()
        .with_stage("fast", Arc::new(FixedStage::new(0.8, 10)))
        .with_stage("slow", Arc::new(SlowStage::new(500, 0.9, 10)));
    let spec = CompositionSpec::new(CompositionNode::Tensor {
        children: vec![
            CompositionNode::stage("fast"),
            CompositionNode::stage("slow"),
        ],
    })
    .with_modifiers(PipelineModifiers {
        branch_timeout_ms: Some(50),
        ..PipelineModifiers::default()
    });

    let err = engine
        .evaluate(&Task::new("joint race"), &spec, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::BranchJoin(_)));
}

#[tokio::test]
async fn spec_level_catch_applies_to_undecorated_stages() {
    let engine = engine()
        .with_stage("broken", Arc::new(BrokenStage))
        .with_stage("good", Arc::new(FixedStage::new(0.9, 10)));
    let spec = CompositionSpec::new(CompositionNode::Sequence {
        children: vec![
            CompositionNode::stage("broken"),
            CompositionNode::stage("good"),
        ],
    })
    .with_modifiers(PipelineModifiers {
        catch: CatchPolicy::Skip,
        ..PipelineModifiers::default()
    });

    let result = engine
        .evaluate(&Task::new("fragile"), &spec, Value::Null)
        .await
        .unwrap();
    assert!((result.quality.aggregate - 0.9).abs() < 1e-9);
}

// Copyright (c) 2025 - Cowboy AI, LLC.

//! Shared stubs for integration tests: deterministic executors and an
//! assessor that reads the score embedded in the stage output.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use prompt_pipeline::{
    EngineResult, PipelineError, QualityAssessor, StageExecutor, StageOutcome, Task,
};

/// Reads the `q` field of the output as the score on every dimension
pub struct EmbeddedAssessor;

impl QualityAssessor for EmbeddedAssessor {
    fn dimensions(&self, output: &Value, _task: &Task) -> [f64; 4] {
        let q = output.get("q").and_then(Value::as_f64).unwrap_or(0.0);
        [q, q, q, q]
    }
}

/// Always succeeds with a fixed quality and cost
pub struct FixedStage {
    pub q: f64,
    pub cost: u64,
}

impl FixedStage {
    pub fn new(q: f64, cost: u64) -> Self {
        Self { q, cost }
    }
}

#[async_trait]
impl StageExecutor for FixedStage {
    async fn execute(&self, _input: Value) -> EngineResult<StageOutcome> {
        Ok(StageOutcome {
            output: json!({"q": self.q}),
            cost: self.cost,
        })
    }
}

/// Pops scripted outputs in order; repeats the last one when exhausted
pub struct ScriptedStage {
    outputs: Mutex<Vec<Value>>,
    pub cost: u64,
}

impl ScriptedStage {
    pub fn new(outputs: Vec<Value>, cost: u64) -> Self {
        Self {
            outputs: Mutex::new(outputs),
            cost,
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptedStage {
    async fn execute(&self, _input: Value) -> EngineResult<StageOutcome> {
        let mut outputs = self.outputs.lock().unwrap();
        let output = if outputs.len() > 1 {
            outputs.remove(0)
        } else {
            outputs.first().cloned().unwrap_or(Value::Null)
        };
        Ok(StageOutcome {
            output,
            cost: self.cost,
        })
    }
}

/// Fails the first `n` invocations, then behaves like [`FixedStage`]
pub struct FlakyStage {
    remaining_failures: AtomicU32,
    pub q: f64,
    pub cost: u64,
}

impl FlakyStage {
    pub fn new(failures: u32, q: f64, cost: u64) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            q,
            cost,
        }
    }
}

#[async_trait]
impl StageExecutor for FlakyStage {
    async fn execute(&self, _input: Value) -> EngineResult<StageOutcome> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::stage("flaky", "transient failure"));
        }
        Ok(StageOutcome {
            output: json!({"q": self.q}),
            cost: self.cost,
        })
    }
}

/// Never succeeds
pub struct BrokenStage;

#[async_trait]
impl StageExecutor for BrokenStage {
    async fn execute(&self, _input: Value) -> EngineResult<StageOutcome> {
        Err(PipelineError::stage("broken", "permanent failure"))
    }
}

/// Sleeps before answering, for branch timeout tests
pub struct SlowStage {
    pub delay: Duration,
    pub q: f64,
    pub cost: u64,
}

impl SlowStage {
    pub fn new(delay_ms: u64, q: f64, cost: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            q,
            cost,
        }
    }
}

#[async_trait]
impl StageExecutor for SlowStage {
    async fn execute(&self, _input: Value) -> EngineResult<StageOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(StageOutcome {
            output: json!({"q": self.q}),
            cost: self.cost,
        })
    }
}

/// Echoes the input back with a fixed score, for threading assertions
pub struct EchoStage {
    pub q: f64,
}

#[async_trait]
impl StageExecutor for EchoStage {
    async fn execute(&self, input: Value) -> EngineResult<StageOutcome> {
        Ok(StageOutcome {
            output: json!({"q": self.q, "echo": input}),
            cost: 1,
        })
    }
}

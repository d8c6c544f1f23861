// Copyright 2025 Cowboy AI, LLC.

//! Pipeline evaluation results

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::budget::BudgetSnapshot;
use crate::checkpoint::Checkpoint;
use crate::quality::QualityVector;
use crate::state_machine::PipelineStatus;

/// Annotation attached when the budget overran its variance allowance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetOverrun {
    /// Cost consumed when the halt fired
    pub used: u64,
    /// The allocation that was exceeded
    pub allocated: u64,
    /// Overrun percentage at halt time
    pub variance_pct: f64,
}

/// Final outcome of one pipeline evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Unique identifier of this run
    pub run_id: Uuid,
    /// Final (possibly partial) value
    pub value: Value,
    /// Final quality
    pub quality: QualityVector,
    /// Merged checkpoint trail in deterministic branch order
    pub checkpoints: Vec<Checkpoint>,
    /// Budget accounting at the end of the run
    pub budget: BudgetSnapshot,
    /// Terminal status; callers branch on this, not on errors
    pub status: PipelineStatus,
    /// Present when the run soft-halted on budget overrun
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrun: Option<BudgetOverrun>,
}

impl PipelineResult {
    /// Deterministic digest of the run, excluding the run id and
    /// checkpoint timestamps
    ///
    /// Two evaluations of an identical (spec, input, deterministic
    /// executors) triple produce equal fingerprints.
    pub fn fingerprint(&self) -> Value {
        let checkpoints: Vec<Value> = self
            .checkpoints
            .iter()
            .map(|c| {
                json!({
                    "iteration": c.iteration,
                    "branch": c.branch,
                    "quality": c.quality,
                    "quality_delta": c.quality_delta,
                    "budget": c.budget,
                    "status": c.status,
                })
            })
            .collect();
        json!({
            "value": self.value,
            "quality": self.quality,
            "status": self.status,
            "budget": self.budget,
            "overrun": self.overrun,
            "checkpoints": checkpoints,
        })
    }
}

// Copyright 2025 Cowboy AI, LLC.

//! Budget allocation and accounting
//!
//! Every executed stage reports an actual cost. The tracker accumulates
//! `used` monotonically against the allocation and flips a soft-halt flag
//! once the overrun exceeds the variance threshold. Overruns are never
//! fatal: the engine returns the best-so-far partial result annotated with
//! the overrun.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::errors::{EngineResult, PipelineError};

/// Cost units allotted per leaf stage when the budget is `auto`
pub const DEFAULT_STAGE_BUDGET: u64 = 1_000;

/// Default allowed overrun before a soft halt, in percent
pub const DEFAULT_VARIANCE_THRESHOLD_PCT: f64 = 20.0;

/// Marker for the engine-computed even split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AutoBudget {
    /// Let the engine compute the allocation from the spec shape
    Auto,
}

/// Budget allocation for one pipeline evaluation
///
/// Deserializes from `int | int[] | "auto"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum Budget {
    /// Explicit total allocation in cost units
    Total(u64),
    /// Explicit per-branch allocation; the tracker enforces the sum
    PerBranch(Vec<u64>),
    /// Engine-computed even split over the spec's leaf stages
    Auto(AutoBudget),
}

impl Default for Budget {
    fn default() -> Self {
        Budget::auto()
    }
}

impl Budget {
    /// The auto allocation marker
    pub fn auto() -> Self {
        Budget::Auto(AutoBudget::Auto)
    }

    /// Resolve the allocation to a total, given the number of leaf stages
    pub fn resolve(&self, leaf_count: usize) -> EngineResult<u64> {
        match self {
            Budget::Total(total) => {
                if *total == 0 {
                    return Err(PipelineError::validation("budget must be positive"));
                }
                Ok(*total)
            }
            Budget::PerBranch(branches) => {
                if branches.is_empty() || branches.iter().any(|b| *b == 0) {
                    return Err(PipelineError::validation(
                        "per-branch budgets must be non-empty and positive",
                    ));
                }
                Ok(branches.iter().sum())
            }
            Budget::Auto(_) => Ok(leaf_count.max(1) as u64 * DEFAULT_STAGE_BUDGET),
        }
    }
}

/// Point-in-time view of budget accounting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct BudgetSnapshot {
    /// Total allocation for the evaluation
    pub allocated: u64,
    /// Cost consumed so far; monotonically non-decreasing
    pub used: u64,
    /// Allocation not yet consumed (saturating)
    pub remaining: u64,
    /// Signed overrun percentage: `(used / allocated - 1) * 100`
    pub variance_pct: f64,
}

#[derive(Debug)]
struct TrackerInner {
    allocated: u64,
    used: u64,
    variance_threshold_pct: f64,
    halted: bool,
}

/// Shared cost accumulator for one pipeline evaluation
///
/// Clones share state, so parallel branches charge against the same
/// allocation. Once the variance threshold is breached the halt flag
/// stays set for the rest of the evaluation.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl BudgetTracker {
    /// Create a tracker over a resolved allocation
    pub fn new(allocated: u64, variance_threshold_pct: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                allocated: allocated.max(1),
                used: 0,
                variance_threshold_pct: variance_threshold_pct.max(0.0),
                halted: false,
            })),
        }
    }

    fn variance(used: u64, allocated: u64) -> f64 {
        (used as f64 / allocated as f64 - 1.0) * 100.0
    }

    /// Record a stage cost and return the resulting snapshot
    pub fn charge(&self, cost: u64) -> BudgetSnapshot {
        let mut inner = self.inner.lock().expect("budget tracker poisoned");
        inner.used = inner.used.saturating_add(cost);
        let variance = Self::variance(inner.used, inner.allocated);
        if variance > inner.variance_threshold_pct {
            inner.halted = true;
        }
        BudgetSnapshot {
            allocated: inner.allocated,
            used: inner.used,
            remaining: inner.allocated.saturating_sub(inner.used),
            variance_pct: variance,
        }
    }

    /// Current accounting without charging
    pub fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().expect("budget tracker poisoned");
        BudgetSnapshot {
            allocated: inner.allocated,
            used: inner.used,
            remaining: inner.allocated.saturating_sub(inner.used),
            variance_pct: Self::variance(inner.used, inner.allocated),
        }
    }

    /// True once the variance threshold has been breached
    pub fn is_halted(&self) -> bool {
        self.inner.lock().expect("budget tracker poisoned").halted
    }

    /// Propagate a halt observed elsewhere, e.g. in a branch sub-tracker
    pub fn force_halt(&self) {
        self.inner.lock().expect("budget tracker poisoned").halted = true;
    }
}

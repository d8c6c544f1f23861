// Copyright 2025 Cowboy AI, LLC.

//! Append-only checkpoint trail
//!
//! Every refinement iteration and every branch join emits a [`Checkpoint`].
//! The recorder accepts concurrent appends from sibling branches without
//! losing entries; snapshots are merged in branch-declaration order, not
//! completion order, so identical inputs yield identical trails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::budget::BudgetSnapshot;
use crate::quality::QualityVector;
use crate::state_machine::PipelineStatus;

/// Snapshot of per-iteration / per-branch state for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Iteration index within the emitting loop or node (1-based)
    pub iteration: u32,
    /// Position of the emitting node in the composition tree, as child
    /// indices from the root in declaration order
    pub branch: Vec<u32>,
    /// Quality observed at this point
    pub quality: QualityVector,
    /// Signed aggregate delta against the previous iteration
    pub quality_delta: f64,
    /// Budget accounting at the time of recording
    pub budget: BudgetSnapshot,
    /// Loop or node status at this point
    pub status: PipelineStatus,
    /// When the checkpoint was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Concurrent append-only recorder for checkpoints
///
/// Clones share the underlying log. Within a branch appends are sequential,
/// so a stable sort on the branch path reconstructs a deterministic trail
/// regardless of cross-branch interleaving.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRecorder {
    entries: Arc<Mutex<Vec<Checkpoint>>>,
}

impl CheckpointRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a checkpoint; never blocks for long and never loses entries
    pub fn record(&self, checkpoint: Checkpoint) {
        self.entries
            .lock()
            .expect("checkpoint recorder poisoned")
            .push(checkpoint);
    }

    /// Number of recorded checkpoints
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("checkpoint recorder poisoned")
            .len()
    }

    /// True when nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The merged trail, ordered by branch declaration path then by
    /// per-branch append order
    pub fn snapshot(&self) -> Vec<Checkpoint> {
        let mut entries = self
            .entries
            .lock()
            .expect("checkpoint recorder poisoned")
            .clone();
        entries.sort_by(|a, b| a.branch.cmp(&b.branch));
        entries
    }
}

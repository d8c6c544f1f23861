// Copyright 2025 Cowboy AI, LLC.

//! MonadPrompt as MONAD - quality-gated iterative refinement
//!
//! [`MonadPrompt`] wraps a value with its quality and refinement history.
//! It forms a monad with:
//! - `unit` (return): lifts a value with its assessed quality
//! - `bind` (>>=): chains refinements, recording the prior state
//!
//! # Monad Laws
//!
//! 1. Left Identity: `unit(a) >>= f ≡ f a`
//! 2. Right Identity: `m >>= unit ≡ m`
//! 3. Associativity: `(m >>= f) >>= g ≡ m >>= (λx. f x >>= g)`
//!
//! Law equality is on the observable payload (value and quality); the
//! history field is an audit trail and excluded from law comparisons.
//!
//! The [`RefinementLoop`] drives the RMP iteration: refine, reassess,
//! compute the delta, and resolve through the transition rules of
//! [`PipelineStatus`]. The loop is sequential and spawns no concurrency;
//! independent loops in sibling parallel branches may run side by side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::budget::BudgetTracker;
use crate::checkpoint::{Checkpoint, CheckpointRecorder};
use crate::comonad::Observation;
use crate::errors::EngineResult;
use crate::quality::{QualityAssessor, QualityVector};
use crate::spec::FallbackStrategy;
use crate::state_machine::{LoopMachine, PipelineStatus, TransitionInput};
use crate::task::Task;

/// A value wrapped with its quality and refinement lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonadPrompt<T> {
    /// The wrapped value
    pub value: T,
    /// Assessed quality of the value
    pub quality: QualityVector,
    /// Refinement depth; zero for freshly lifted values
    pub meta_level: u32,
    /// Prior states, oldest first. Entries are flattened snapshots so the
    /// trail grows linearly with the number of binds.
    pub history: Vec<MonadPrompt<T>>,
}

impl<T> MonadPrompt<T> {
    /// unit/return: lift a value with a precomputed quality
    pub fn unit_with(value: T, quality: QualityVector) -> Self {
        Self {
            value,
            quality,
            meta_level: 0,
            history: Vec::new(),
        }
    }
}

impl<T: Clone> MonadPrompt<T> {
    /// A flattened copy of this state, without its own history
    fn snapshot(&self) -> MonadPrompt<T> {
        MonadPrompt {
            value: self.value.clone(),
            quality: self.quality,
            meta_level: self.meta_level,
            history: Vec::new(),
        }
    }

    /// bind/flatMap: apply a refinement function and record the prior state
    ///
    /// The resulting prompt's history is `self.history + [self]`; the
    /// value, quality and meta level come from `f`.
    pub fn bind<F>(self, f: F) -> MonadPrompt<T>
    where
        F: FnOnce(&T) -> MonadPrompt<T>,
    {
        let mut next = f(&self.value);
        let mut history = self.history.clone();
        history.push(self.snapshot());
        next.history = history;
        next
    }

    /// The best-seen candidate by aggregate quality
    ///
    /// Scans the history (later entries win ties) and returns the current
    /// state only when it is strictly better than everything recorded.
    pub fn best_candidate(&self) -> &MonadPrompt<T> {
        let mut best: Option<&MonadPrompt<T>> = None;
        for entry in &self.history {
            match best {
                Some(b) if entry.quality.aggregate < b.quality.aggregate => {}
                _ => best = Some(entry),
            }
        }
        match best {
            Some(b) if self.quality.aggregate <= b.quality.aggregate => b,
            _ => self,
        }
    }
}

impl MonadPrompt<Value> {
    /// unit/return: lift a value, assessing its quality for the task
    pub fn unit(value: Value, assessor: &dyn QualityAssessor, task: &Task) -> Self {
        let quality = assessor.assess(&value, task);
        Self::unit_with(value, quality)
    }
}

/// One refinement step produced by a [`Refiner`]
#[derive(Debug, Clone)]
pub struct Refinement {
    /// The refined value
    pub value: Value,
    /// Actual cost of producing it
    pub cost: u64,
}

/// Collaborator that produces a refined value from an observation
///
/// Receives the full observation, not just the current value, so
/// implementations can steer on history.
#[async_trait]
pub trait Refiner: Send + Sync {
    /// Produce the next candidate value
    async fn refine(&self, observation: &Observation<Value>) -> EngineResult<Refinement>;
}

/// Tuning knobs for the refinement loop
#[derive(Debug, Clone)]
pub struct RefinementConfig {
    /// Aggregate quality at which the loop converges
    pub quality_threshold: f64,
    /// Cap on refinement passes
    pub max_iterations: u32,
    /// Minimum aggregate delta that still counts as improvement
    pub plateau_epsilon: f64,
    /// What to return on a non-converged terminal
    pub fallback: FallbackStrategy,
    /// Retention cap on the observation history the refiner sees
    pub history_cap: usize,
    /// Value used by [`FallbackStrategy::UseDefault`]
    pub default_value: Option<Value>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.8,
            max_iterations: 5,
            plateau_epsilon: 0.02,
            fallback: FallbackStrategy::ReturnBest,
            history_cap: crate::comonad::DEFAULT_HISTORY_CAP,
            default_value: None,
        }
    }
}

/// Outcome of a refinement loop run
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    /// The selected prompt (per the fallback strategy) with full lineage
    pub prompt: MonadPrompt<Value>,
    /// Terminal status of the loop
    pub status: PipelineStatus,
    /// Number of observations made, counting the seed as iteration 1
    pub iterations: u32,
}

#[derive(Debug, Clone)]
struct IterationInput {
    iteration: u32,
    aggregate: f64,
    delta: f64,
}

impl TransitionInput for IterationInput {
    fn description(&self) -> String {
        format!(
            "iteration {} aggregate {:.3} delta {:+.3}",
            self.iteration, self.aggregate, self.delta
        )
    }
}

/// The quality-gated iteration loop (RMP loop)
///
/// Sequential and single-threaded per pipeline instance. Terminal rules
/// are checked in a fixed order: convergence, iteration cap, plateau,
/// degradation; the budget check runs independently every pass and can
/// force a halt regardless of quality state. Plateau and degradation each
/// require two consecutive qualifying steps before they fire.
pub struct RefinementLoop<'a> {
    config: RefinementConfig,
    assessor: &'a dyn QualityAssessor,
    recorder: &'a CheckpointRecorder,
    budget: &'a BudgetTracker,
    branch: Vec<u32>,
}

impl<'a> RefinementLoop<'a> {
    /// Create a loop bound to shared run state
    pub fn new(
        config: RefinementConfig,
        assessor: &'a dyn QualityAssessor,
        recorder: &'a CheckpointRecorder,
        budget: &'a BudgetTracker,
        branch: Vec<u32>,
    ) -> Self {
        Self {
            config,
            assessor,
            recorder,
            budget,
            branch,
        }
    }

    fn checkpoint(&self, iteration: u32, quality: QualityVector, delta: f64, status: PipelineStatus) {
        self.recorder.record(Checkpoint {
            iteration,
            branch: self.branch.clone(),
            quality,
            quality_delta: delta,
            budget: self.budget.snapshot(),
            status,
            recorded_at: chrono::Utc::now(),
        });
    }

    fn select(&self, prompt: MonadPrompt<Value>, status: PipelineStatus) -> MonadPrompt<Value> {
        if status == PipelineStatus::Converged {
            return prompt;
        }
        match &self.config.fallback {
            FallbackStrategy::ReturnBest => {
                let best = prompt.best_candidate().clone();
                MonadPrompt {
                    value: best.value,
                    quality: best.quality,
                    meta_level: prompt.meta_level,
                    history: prompt.history,
                }
            }
            FallbackStrategy::ReturnLast => prompt,
            FallbackStrategy::UseDefault => {
                let value = self.config.default_value.clone().unwrap_or(Value::Null);
                MonadPrompt {
                    quality: QualityVector::zero(),
                    value,
                    meta_level: prompt.meta_level,
                    history: prompt.history,
                }
            }
            FallbackStrategy::Empty => MonadPrompt {
                value: Value::Null,
                quality: QualityVector::zero(),
                meta_level: prompt.meta_level,
                history: prompt.history,
            },
        }
    }

    /// Run the loop from a seed value
    pub async fn run(
        &self,
        task: &Task,
        seed: Value,
        refiner: &dyn Refiner,
    ) -> EngineResult<RefinementOutcome> {
        let mut machine = LoopMachine::new(PipelineStatus::Continue);
        let seed_quality = self.assessor.assess(&seed, task);
        let mut observation = Observation::new(seed.clone())
            .with_history_cap(self.config.history_cap)
            .with_context("intent", Value::String(task.intent.clone()));
        let mut prompt = MonadPrompt::unit_with(seed, seed_quality);
        let mut iteration: u32 = 1;
        let mut last_delta = 0.0;
        let mut plateau_streak = 0u32;
        let mut degrade_streak = 0u32;

        self.checkpoint(iteration, prompt.quality, 0.0, PipelineStatus::Continue);

        let status = loop {
            // Terminal rules, in order
            if prompt.quality.aggregate >= self.config.quality_threshold {
                break PipelineStatus::Converged;
            }
            if iteration > self.config.max_iterations {
                break PipelineStatus::MaxIterations;
            }
            if plateau_streak >= 2 {
                break PipelineStatus::Plateau;
            }
            if degrade_streak >= 2 {
                break PipelineStatus::Degrading;
            }
            // Budget check is independent of quality state
            if self.budget.is_halted() {
                break PipelineStatus::Halted;
            }

            let refinement = refiner.refine(&observation).await?;
            self.budget.charge(refinement.cost);
            let quality = self.assessor.assess(&refinement.value, task);
            let delta = quality.delta_from(&prompt.quality);
            iteration += 1;

            if delta.abs() < self.config.plateau_epsilon {
                plateau_streak += 1;
            } else {
                plateau_streak = 0;
            }
            if delta < -self.config.plateau_epsilon {
                degrade_streak += 1;
            } else {
                degrade_streak = 0;
            }
            last_delta = delta;

            let input = IterationInput {
                iteration,
                aggregate: quality.aggregate,
                delta,
            };
            debug!(iteration, aggregate = quality.aggregate, delta, "refinement step");
            machine.transition_to(PipelineStatus::Continue, &input)?;
            self.checkpoint(iteration, quality, delta, PipelineStatus::Continue);

            observation = observation.step(refinement.value.clone());
            let meta_level = prompt.meta_level + 1;
            prompt = prompt.bind(|_| MonadPrompt {
                value: refinement.value,
                quality,
                meta_level,
                history: Vec::new(),
            });
        };

        let input = IterationInput {
            iteration,
            aggregate: prompt.quality.aggregate,
            delta: last_delta,
        };
        machine.transition_to(status, &input)?;

        let selected = self.select(prompt, status);
        self.checkpoint(iteration, selected.quality, last_delta, status);
        debug!(status = %status, iterations = iteration, "refinement loop finished");

        Ok(RefinementOutcome {
            prompt: selected,
            status,
            iterations: iteration,
        })
    }
}

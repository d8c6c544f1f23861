// Copyright 2025 Cowboy AI, LLC.

//! # Prompt Pipeline
//!
//! Quality-gated pipeline composition engine: given a task and a tree of
//! composable stages, evaluate the tree under four composition operators,
//! propagate a bounded quality score through the evaluation, and drive a
//! bounded iterative-refinement loop.
//!
//! Building blocks:
//! - **PromptFunctor**: structure-preserving map from tasks to staged
//!   pipeline plans, with verified identity/composition laws
//! - **QualityAssessor**: weighted four-dimensional scoring with a
//!   bounded aggregate
//! - **Observation**: comonadic execution-history carrier with verified
//!   extract/duplicate/extend laws
//! - **MonadPrompt**: monadic refinement carrier with verified
//!   unit/bind laws, driving the quality-gated iteration loop
//! - **CompositionEngine**: bottom-up evaluation of
//!   SEQUENCE/PARALLEL/TENSOR/KLEISLI trees over opaque stage executors,
//!   with per-node error recovery and budget-gated soft halts
//! - **CheckpointRecorder**: append-only, concurrency-safe trail of
//!   per-iteration and per-branch state
//!
//! ## Design Principles
//!
//! 1. **Laws over conventions**: the functor, monad and comonad carriers
//!    keep their laws property-testable with structural equality
//! 2. **Status over exceptions**: plateau, degradation, convergence and
//!    budget overrun are terminal statuses on the result, not errors
//! 3. **Explicit collaborators**: classification, stage execution and
//!    branch merging are injected traits, never hard-coded tables
//! 4. **Determinism**: identical inputs with deterministic executors
//!    yield identical results and checkpoint trails

#![warn(missing_docs)]

mod budget;
mod checkpoint;
mod comonad;
mod engine;
mod errors;
mod functor;
mod quality;
mod refinement;
mod result;
mod spec;
mod state_machine;
mod task;

// Re-export core types
pub use budget::{
    AutoBudget, Budget, BudgetSnapshot, BudgetTracker, DEFAULT_STAGE_BUDGET,
    DEFAULT_VARIANCE_THRESHOLD_PCT,
};
pub use checkpoint::{Checkpoint, CheckpointRecorder};
pub use comonad::{Observation, DEFAULT_HISTORY_CAP};
pub use engine::{
    BranchOutput, BranchReducer, BranchResult, BranchSpawner, CompositionEngine, DefaultReducer,
    NodeEval, StageExecutor, StageOutcome, TokioSpawner,
};
pub use errors::{EngineResult, PipelineError};
pub use functor::{
    PipelinePlan, PromptFunctor, PromptRegistry, DEFAULT_CONFIDENCE_FLOOR,
};
pub use quality::{HeuristicAssessor, QualityAssessor, QualityVector, QualityWeights};
pub use refinement::{
    MonadPrompt, Refinement, RefinementConfig, RefinementLoop, RefinementOutcome, Refiner,
};
pub use result::{BudgetOverrun, PipelineResult};
pub use spec::{
    CatchPolicy, CompositionNode, CompositionSpec, FallbackStrategy, PipelineModifiers,
    MAX_RETRY_ATTEMPTS,
};
pub use state_machine::{
    LoopMachine, LoopStateTransitions, PipelineStatus, State, StateTransition, TransitionInput,
};
pub use task::{Classification, Classifier, Domain, StaticClassifier, Task, Tier};

// Copyright 2025 Cowboy AI, LLC.

//! Composition engine: bottom-up evaluation of operator trees
//!
//! The engine walks a resolved [`CompositionNode`] tree and evaluates it
//! over opaque [`StageExecutor`]s:
//! - SEQUENCE threads outputs left to right; quality is the minimum over
//!   children and costs add up.
//! - PARALLEL fans out over independent input snapshots; quality is the
//!   mean over surviving branches and the cost is the maximum branch cost.
//! - TENSOR fans out like PARALLEL but every branch must succeed and
//!   quality is the minimum.
//! - KLEISLI threads like SEQUENCE, but any stage below the quality
//!   threshold goes through the refinement loop in place first. Each
//!   stage improves locally; overall fidelity stays bounded by what
//!   upstream stages supplied.
//!
//! Fan-out uses a spawn/join abstraction ([`BranchSpawner`]); branches
//! receive read-only input snapshots, never observe each other, and are
//! joined at a barrier in declaration order. Failures bubble toward the
//! root unless a node-local catch policy intercepts them.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{Budget, BudgetTracker};
use crate::checkpoint::{Checkpoint, CheckpointRecorder};
use crate::comonad::Observation;
use crate::errors::{EngineResult, PipelineError};
use crate::quality::{QualityAssessor, QualityVector};
use crate::refinement::{Refinement, RefinementConfig, RefinementLoop, Refiner};
use crate::result::{BudgetOverrun, PipelineResult};
use crate::spec::{CatchPolicy, CompositionNode, CompositionSpec, PipelineModifiers};
use crate::state_machine::PipelineStatus;
use crate::task::Task;

/// Initial backoff delay for `retry:N`
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Backoff ceiling for `retry:N`
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Output and actual cost reported by a stage
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// The stage's output value
    pub output: Value,
    /// Actual cost in budget units
    pub cost: u64,
}

/// Opaque, potentially failing stage collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Execute the stage over an input value
    async fn execute(&self, input: Value) -> EngineResult<StageOutcome>;
}

/// A surviving branch handed to the reducer
#[derive(Debug, Clone)]
pub struct BranchOutput {
    /// Declaration index of the branch
    pub index: usize,
    /// Branch output value
    pub value: Value,
    /// Branch quality
    pub quality: QualityVector,
}

/// Merges parallel branch outputs into one value
pub trait BranchReducer: Send + Sync {
    /// Merge surviving branches; structurally incompatible outputs should
    /// surface as [`PipelineError::MergeConflict`], never be dropped
    fn reduce(&self, branches: &[BranchOutput]) -> EngineResult<Value>;
}

/// Default reducer: the structured list of branch outputs plus the
/// highest-quality branch
#[derive(Debug, Clone, Default)]
pub struct DefaultReducer;

impl BranchReducer for DefaultReducer {
    fn reduce(&self, branches: &[BranchOutput]) -> EngineResult<Value> {
        if branches.is_empty() {
            return Err(PipelineError::MergeConflict(
                "no branches survived to merge".into(),
            ));
        }
        let mut best = &branches[0];
        for branch in &branches[1..] {
            if branch.quality.aggregate > best.quality.aggregate {
                best = branch;
            }
        }
        let outputs: Vec<&Value> = branches.iter().map(|b| &b.value).collect();
        Ok(json!({
            "branches": outputs,
            "best": best.value.clone(),
            "best_index": best.index,
        }))
    }
}

/// Result of evaluating one node
#[derive(Debug, Clone)]
pub struct NodeEval {
    /// The node's output value
    pub value: Value,
    /// The node's propagated quality
    pub quality: QualityVector,
}

/// Outcome of one spawned branch: evaluated, skipped, or failed
pub type BranchResult = EngineResult<Option<NodeEval>>;

/// Spawn/join abstraction for fan-out nodes
///
/// Implementations run every branch to completion (or cancellation) and
/// return results in declaration order - a barrier join.
#[async_trait]
pub trait BranchSpawner: Send + Sync {
    /// Run all branches concurrently and join them in order
    async fn run_all(&self, branches: Vec<BoxFuture<'static, BranchResult>>) -> Vec<BranchResult>;
}

/// Tokio-task-based spawner, the default host binding
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner;

#[async_trait]
impl BranchSpawner for TokioSpawner {
    async fn run_all(&self, branches: Vec<BoxFuture<'static, BranchResult>>) -> Vec<BranchResult> {
        let handles: Vec<_> = branches.into_iter().map(tokio::spawn).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(PipelineError::BranchJoin(e.to_string()))),
            );
        }
        results
    }
}

/// Shared per-run state threaded through the tree walk
#[derive(Clone)]
struct RunContext {
    task: Arc<Task>,
    modifiers: Arc<PipelineModifiers>,
    tracker: BudgetTracker,
    recorder: CheckpointRecorder,
}

impl RunContext {
    /// Derive the context for one fan-out branch: shared recorder and
    /// task, but an isolated sub-tracker so concurrent branch costs are
    /// accounted as `max`, not as a sum
    fn branch(&self, index: usize) -> RunContext {
        let allocated = match &self.modifiers.budget {
            Budget::PerBranch(v) if !v.is_empty() => v[index % v.len()],
            _ => self.tracker.snapshot().remaining.max(1),
        };
        RunContext {
            task: Arc::clone(&self.task),
            modifiers: Arc::clone(&self.modifiers),
            tracker: BudgetTracker::new(allocated, self.modifiers.variance_threshold_pct),
            recorder: self.recorder.clone(),
        }
    }
}

enum Fanout {
    Parallel,
    Tensor,
}

/// Evaluates composition trees over registered stage executors
#[derive(Clone)]
pub struct CompositionEngine {
    executors: IndexMap<String, Arc<dyn StageExecutor>>,
    assessor: Arc<dyn QualityAssessor>,
    reducer: Arc<dyn BranchReducer>,
    spawner: Arc<dyn BranchSpawner>,
}

impl CompositionEngine {
    /// Create an engine with the default reducer and spawner
    pub fn new(assessor: Arc<dyn QualityAssessor>) -> Self {
        Self {
            executors: IndexMap::new(),
            assessor,
            reducer: Arc::new(DefaultReducer),
            spawner: Arc::new(TokioSpawner),
        }
    }

    /// Register a stage executor under a name
    pub fn with_stage(mut self, name: impl Into<String>, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// Override the branch reducer
    pub fn with_reducer(mut self, reducer: Arc<dyn BranchReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    /// Override the spawn/join implementation
    pub fn with_spawner(mut self, spawner: Arc<dyn BranchSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Evaluate a validated spec over an input value
    ///
    /// Budget overruns soft-halt the evaluation: the best-so-far partial
    /// result comes back with [`PipelineStatus::Halted`] and an overrun
    /// annotation instead of an error.
    pub async fn evaluate(
        &self,
        task: &Task,
        spec: &CompositionSpec,
        input: Value,
    ) -> EngineResult<PipelineResult> {
        spec.validate()?;
        let root = spec.resolved_root()?;
        let allocated = spec.modifiers.budget.resolve(spec.leaf_count()?)?;
        let ctx = RunContext {
            task: Arc::new(task.clone()),
            modifiers: Arc::new(spec.modifiers.clone()),
            tracker: BudgetTracker::new(allocated, spec.modifiers.variance_threshold_pct),
            recorder: CheckpointRecorder::new(),
        };
        info!(allocated, intent = %task.intent, "pipeline evaluation started");

        let eval = self
            .eval_node(root, input.clone(), ctx.clone(), Vec::new())
            .await?;
        let (value, quality) = match eval {
            Some(eval) => (eval.value, eval.quality),
            // Every stage skipped: the identity pipeline
            None => (input, QualityVector::perfect()),
        };

        let budget = ctx.tracker.snapshot();
        let halted = ctx.tracker.is_halted();
        let status = if halted {
            PipelineStatus::Halted
        } else {
            PipelineStatus::Completed
        };
        let overrun = halted.then_some(BudgetOverrun {
            used: budget.used,
            allocated: budget.allocated,
            variance_pct: budget.variance_pct,
        });
        info!(status = %status, used = budget.used, "pipeline evaluation finished");

        Ok(PipelineResult {
            run_id: Uuid::new_v4(),
            value,
            quality,
            checkpoints: ctx.recorder.snapshot(),
            budget,
            status,
            overrun,
        })
    }

    fn eval_node(
        &self,
        node: CompositionNode,
        input: Value,
        ctx: RunContext,
        path: Vec<u32>,
    ) -> BoxFuture<'static, BranchResult> {
        let engine = self.clone();
        async move {
            match node {
                CompositionNode::Stage {
                    name,
                    catch,
                    substitute,
                } => {
                    engine
                        .eval_stage(&name, catch, substitute, input, &ctx, &path)
                        .await
                }
                CompositionNode::Sequence { children } => {
                    engine.eval_sequence(children, input, ctx, path).await
                }
                CompositionNode::Parallel { children } => {
                    engine
                        .eval_fanout(children, input, ctx, path, Fanout::Parallel)
                        .await
                }
                CompositionNode::Tensor { children } => {
                    engine
                        .eval_fanout(children, input, ctx, path, Fanout::Tensor)
                        .await
                }
                CompositionNode::Kleisli { children } => {
                    engine.eval_kleisli(children, input, ctx, path).await
                }
                CompositionNode::Ref { name } => Err(PipelineError::Internal(format!(
                    "unresolved reference '{name}' reached evaluation"
                ))),
            }
        }
        .boxed()
    }

    async fn eval_stage(
        &self,
        name: &str,
        catch: Option<CatchPolicy>,
        substitute: Option<Value>,
        input: Value,
        ctx: &RunContext,
        path: &[u32],
    ) -> BranchResult {
        let executor = self
            .executors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))?
            .clone();
        let policy = catch.unwrap_or_else(|| ctx.modifiers.catch.clone());

        let mut attempts_left = match &policy {
            CatchPolicy::Retry(n) => *n,
            _ => 0,
        };
        let mut backoff = RETRY_BACKOFF_BASE;

        let failure = loop {
            match executor.execute(input.clone()).await {
                Ok(outcome) => {
                    ctx.tracker.charge(outcome.cost);
                    let quality = self.assessor.assess(&outcome.output, &ctx.task);
                    debug!(stage = name, aggregate = quality.aggregate, cost = outcome.cost, "stage executed");
                    self.stage_checkpoint(ctx, path, quality);
                    return Ok(Some(NodeEval {
                        value: outcome.output,
                        quality,
                    }));
                }
                Err(e) if attempts_left > 0 && e.is_recoverable() => {
                    warn!(stage = name, error = %e, attempts_left, "stage failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    attempts_left -= 1;
                }
                Err(e) => break e,
            }
        };

        match policy {
            CatchPolicy::Halt | CatchPolicy::Retry(_) => Err(failure),
            CatchPolicy::Log => {
                warn!(stage = name, error = %failure, "stage failed, logged as quality zero");
                let quality = QualityVector::zero();
                self.stage_checkpoint(ctx, path, quality);
                // input threads through unchanged so downstream stages still run
                Ok(Some(NodeEval {
                    value: input,
                    quality,
                }))
            }
            CatchPolicy::Skip => {
                warn!(stage = name, error = %failure, "stage failed, skipped");
                Ok(None)
            }
            CatchPolicy::Substitute => {
                let value = substitute
                    .or_else(|| ctx.modifiers.default_value.clone())
                    .unwrap_or(Value::Null);
                let quality = self.assessor.assess(&value, &ctx.task);
                warn!(stage = name, error = %failure, "stage failed, substituted fallback");
                self.stage_checkpoint(ctx, path, quality);
                Ok(Some(NodeEval { value, quality }))
            }
        }
    }

    async fn eval_sequence(
        &self,
        children: Vec<CompositionNode>,
        input: Value,
        ctx: RunContext,
        path: Vec<u32>,
    ) -> BranchResult {
        let mut current = input;
        let mut qualities = Vec::new();
        for (i, child) in children.into_iter().enumerate() {
            // Soft halt: stop executing, keep the partial value
            if ctx.tracker.is_halted() {
                break;
            }
            let mut child_path = path.clone();
            child_path.push(i as u32);
            match self
                .eval_node(child, current.clone(), ctx.clone(), child_path)
                .await?
            {
                Some(eval) => {
                    current = eval.value;
                    qualities.push(eval.quality);
                }
                // Skipped stage: input threads through unchanged
                None => {}
            }
        }
        Ok(Some(NodeEval {
            value: current,
            quality: QualityVector::min_of(&qualities),
        }))
    }

    async fn eval_kleisli(
        &self,
        children: Vec<CompositionNode>,
        input: Value,
        ctx: RunContext,
        path: Vec<u32>,
    ) -> BranchResult {
        let mut current = input;
        let mut qualities = Vec::new();
        for (i, child) in children.into_iter().enumerate() {
            if ctx.tracker.is_halted() {
                break;
            }
            let mut child_path = path.clone();
            child_path.push(i as u32);
            let eval = self
                .eval_node(child.clone(), current.clone(), ctx.clone(), child_path.clone())
                .await?;
            let Some(mut eval) = eval else {
                continue;
            };

            // Quality gate: refine in place before passing downstream
            if eval.quality.aggregate < ctx.modifiers.quality_threshold
                && !ctx.tracker.is_halted()
            {
                debug!(
                    aggregate = eval.quality.aggregate,
                    threshold = ctx.modifiers.quality_threshold,
                    "kleisli stage below threshold, refining"
                );
                let config = RefinementConfig {
                    quality_threshold: ctx.modifiers.quality_threshold,
                    max_iterations: ctx.modifiers.max_iterations,
                    plateau_epsilon: ctx.modifiers.plateau_epsilon,
                    fallback: ctx.modifiers.fallback,
                    history_cap: ctx.modifiers.history_cap,
                    default_value: ctx.modifiers.default_value.clone(),
                };
                let rmp = RefinementLoop::new(
                    config,
                    self.assessor.as_ref(),
                    &ctx.recorder,
                    &ctx.tracker,
                    child_path.clone(),
                );
                let refiner = NodeRefiner {
                    engine: self.clone(),
                    node: child,
                    ctx: ctx.clone(),
                    path: child_path,
                };
                let outcome = rmp.run(&ctx.task, eval.value, &refiner).await?;
                eval = NodeEval {
                    value: outcome.prompt.value,
                    quality: outcome.prompt.quality,
                };
            }

            current = eval.value;
            qualities.push(eval.quality);
        }
        Ok(Some(NodeEval {
            value: current,
            quality: QualityVector::min_of(&qualities),
        }))
    }

    async fn eval_fanout(
        &self,
        children: Vec<CompositionNode>,
        input: Value,
        ctx: RunContext,
        path: Vec<u32>,
        kind: Fanout,
    ) -> BranchResult {
        let mut futures = Vec::with_capacity(children.len());
        let mut subtrackers = Vec::with_capacity(children.len());
        for (i, child) in children.into_iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(i as u32);
            // Copy-on-branch: each child gets an independent input snapshot
            let branch_ctx = ctx.branch(i);
            subtrackers.push(branch_ctx.tracker.clone());
            let fut = self.eval_node(child, input.clone(), branch_ctx, child_path);
            let fut = match ctx.modifiers.branch_timeout_ms {
                Some(ms) => async move {
                    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::BranchJoin("branch timed out".into())),
                    }
                }
                .boxed(),
                None => fut,
            };
            futures.push(fut);
        }

        // Barrier join in declaration order
        let results = self.spawner.run_all(futures).await;

        // Concurrent branches: the node costs as much as its slowest
        // branch, not the sum
        let max_used = subtrackers
            .iter()
            .map(|t| t.snapshot().used)
            .max()
            .unwrap_or(0);
        ctx.tracker.charge(max_used);
        if subtrackers.iter().any(|t| t.is_halted()) {
            ctx.tracker.force_halt();
        }

        let mut survivors = Vec::new();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(Some(eval)) => survivors.push(BranchOutput {
                    index: i,
                    value: eval.value,
                    quality: eval.quality,
                }),
                Ok(None) => {}
                Err(e) => match kind {
                    // Cancelled branches are excluded from the parallel mean
                    Fanout::Parallel if matches!(e, PipelineError::BranchJoin(_)) => {
                        warn!(branch = i, error = %e, "parallel branch cancelled, excluded");
                    }
                    _ => return Err(e),
                },
            }
        }

        let quality = match kind {
            Fanout::Parallel => {
                if survivors.len() < ctx.modifiers.min_parallel_branches {
                    return Err(PipelineError::MergeConflict(format!(
                        "only {} of the required {} parallel branches survived",
                        survivors.len(),
                        ctx.modifiers.min_parallel_branches
                    )));
                }
                QualityVector::mean_of(
                    &survivors.iter().map(|b| b.quality).collect::<Vec<_>>(),
                )
            }
            Fanout::Tensor => QualityVector::min_of(
                &survivors.iter().map(|b| b.quality).collect::<Vec<_>>(),
            ),
        };
        let value = self.reducer.reduce(&survivors)?;
        self.stage_checkpoint(&ctx, &path, quality);
        Ok(Some(NodeEval { value, quality }))
    }

    fn stage_checkpoint(&self, ctx: &RunContext, path: &[u32], quality: QualityVector) {
        let status = if ctx.tracker.is_halted() {
            PipelineStatus::Halted
        } else {
            PipelineStatus::Continue
        };
        ctx.recorder.record(Checkpoint {
            iteration: 1,
            branch: path.to_vec(),
            quality,
            quality_delta: 0.0,
            budget: ctx.tracker.snapshot(),
            status,
            recorded_at: chrono::Utc::now(),
        });
    }
}

/// Refiner that re-evaluates a node with its own output as input
struct NodeRefiner {
    engine: CompositionEngine,
    node: CompositionNode,
    ctx: RunContext,
    path: Vec<u32>,
}

#[async_trait]
impl Refiner for NodeRefiner {
    async fn refine(&self, observation: &Observation<Value>) -> EngineResult<Refinement> {
        let eval = self
            .engine
            .eval_node(
                self.node.clone(),
                observation.extract().clone(),
                self.ctx.clone(),
                self.path.clone(),
            )
            .await?;
        let value = match eval {
            Some(eval) => eval.value,
            None => observation.extract().clone(),
        };
        // Stage costs were charged during evaluation
        Ok(Refinement { value, cost: 0 })
    }
}

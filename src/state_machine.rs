// Copyright 2025 Cowboy AI, LLC.

//! State machine for the refinement loop
//!
//! The quality-gated iteration loop is a small state machine with one
//! non-terminal state and six terminal outcomes. Transitions are enforced
//! through [`LoopStateTransitions`]; invalid transitions are rejected
//! rather than silently absorbed, which keeps the loop's control flow
//! auditable through its transition history.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uuid::Uuid;

use crate::errors::{EngineResult, PipelineError};

/// Input to a state machine transition
pub trait TransitionInput: Debug + Clone + Send + Sync {
    /// Get a description of this input for logging
    fn description(&self) -> String;
}

/// Trait for types that can be used as states in a state machine
pub trait State: Debug + Clone + PartialEq + Eq + Send + Sync {
    /// Get the name of this state for logging/debugging
    fn name(&self) -> &'static str;

    /// Check if this is a terminal state
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Valid transitions for a loop state
pub trait LoopStateTransitions: State {
    /// Check if a transition to the target state is valid
    fn can_transition_to(&self, target: &Self) -> bool;

    /// Get all valid target states from this state
    fn valid_transitions(&self) -> Vec<Self>;
}

/// Terminal and in-flight statuses of a pipeline evaluation
///
/// `Continue` is the only non-terminal state. The quality-gated loop
/// resolves to one of the quality terminals; `Halted` is forced by the
/// budget check independent of quality state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Iteration continues
    Continue,
    /// Tree evaluation finished without engaging the refinement loop
    Completed,
    /// Aggregate quality reached the threshold
    Converged,
    /// Iteration cap reached before the threshold
    MaxIterations,
    /// Quality improvement fell below the plateau epsilon
    Plateau,
    /// Quality regressed on two consecutive iterations
    Degrading,
    /// Budget overran its variance allowance; partial result returned
    Halted,
}

impl State for PipelineStatus {
    fn name(&self) -> &'static str {
        match self {
            PipelineStatus::Continue => "Continue",
            PipelineStatus::Completed => "Completed",
            PipelineStatus::Converged => "Converged",
            PipelineStatus::MaxIterations => "MaxIterations",
            PipelineStatus::Plateau => "Plateau",
            PipelineStatus::Degrading => "Degrading",
            PipelineStatus::Halted => "Halted",
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Continue)
    }
}

impl LoopStateTransitions for PipelineStatus {
    fn can_transition_to(&self, target: &Self) -> bool {
        match self {
            // Continue may stay put or resolve to any terminal
            PipelineStatus::Continue => true,
            // Terminals are absorbing
            _ => self == target,
        }
    }

    fn valid_transitions(&self) -> Vec<Self> {
        match self {
            PipelineStatus::Continue => vec![
                PipelineStatus::Continue,
                PipelineStatus::Completed,
                PipelineStatus::Converged,
                PipelineStatus::MaxIterations,
                PipelineStatus::Plateau,
                PipelineStatus::Degrading,
                PipelineStatus::Halted,
            ],
            other => vec![*other],
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Record of a state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition<S> {
    /// The state before the transition
    pub from: S,
    /// The state after the transition
    pub to: S,
    /// Description of the input that triggered the transition
    pub input: String,
    /// Unique identifier for this transition instance
    pub transition_id: Uuid,
    /// When the transition occurred
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A state machine tracking loop status and its transition history
#[derive(Debug, Clone)]
pub struct LoopMachine<S: LoopStateTransitions> {
    current_state: S,
    transition_history: Vec<StateTransition<S>>,
}

impl<S: LoopStateTransitions> LoopMachine<S> {
    /// Create a new machine in the given initial state
    pub fn new(initial_state: S) -> Self {
        Self {
            current_state: initial_state,
            transition_history: Vec::new(),
        }
    }

    /// Get the current state
    pub fn current_state(&self) -> &S {
        &self.current_state
    }

    /// Get the transition history
    pub fn history(&self) -> &[StateTransition<S>] {
        &self.transition_history
    }

    /// Attempt a transition, recording it on success
    pub fn transition_to<I: TransitionInput>(&mut self, target: S, input: &I) -> EngineResult<()> {
        if !self.current_state.can_transition_to(&target) {
            return Err(PipelineError::Internal(format!(
                "invalid loop transition from {} to {}",
                self.current_state.name(),
                target.name()
            )));
        }
        self.transition_history.push(StateTransition {
            from: self.current_state.clone(),
            to: target.clone(),
            input: input.description(),
            transition_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
        self.current_state = target;
        Ok(())
    }
}

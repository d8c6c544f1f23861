// Copyright 2025 Cowboy AI, LLC.

//! Error types for pipeline evaluation
//!
//! Only genuinely exceptional conditions are errors. Budget overruns and
//! convergence failures are expressed as terminal [`crate::PipelineStatus`]
//! values on the result, so callers branch on status rather than catching.

use thiserror::Error;

/// Errors that can occur while building or evaluating a pipeline
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Malformed composition spec or modifiers, rejected before evaluation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A composition spec references itself, directly or transitively
    #[error("Cyclic composition spec: reference chain through '{0}'")]
    CyclicSpec(String),

    /// The classifier collaborator itself failed (low confidence is not an
    /// error; the functor falls back to the generic domain instead)
    #[error("Classification ambiguous for task: {0}")]
    ClassificationAmbiguous(String),

    /// A stage executor failed
    #[error("Stage execution failed: {stage} - {message}")]
    StageExecution {
        /// Name of the failing stage
        stage: String,
        /// Error message from the executor
        message: String,
    },

    /// No executor registered under the requested stage name
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Parallel branch outputs could not be merged
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// A spawned branch was cancelled or its join failed
    #[error("Branch join failed: {0}")]
    BranchJoin(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for pipeline operations
pub type EngineResult<T> = Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl PipelineError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    /// Create a stage execution error
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Check if this error was raised before evaluation began
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_) | PipelineError::CyclicSpec(_)
        )
    }

    /// Check if this error is recoverable under a node's catch policy
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::StageExecution { .. }
                | PipelineError::BranchJoin(_)
                | PipelineError::ClassificationAmbiguous(_)
        )
    }
}

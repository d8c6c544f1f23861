// Copyright 2025 Cowboy AI, LLC.

//! Tasks and their classification
//!
//! A [`Task`] is the free-text intent handed to the pipeline, optionally
//! carrying an explicit domain/tier override. Classification is delegated
//! to an external [`Classifier`] collaborator; the core never hard-codes
//! keyword tables.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;

/// Problem domain a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Source code authoring or review
    Code,
    /// Analytical or investigative work
    Analysis,
    /// Prose and documentation
    Writing,
    /// Information gathering and synthesis
    Research,
    /// Fallback when classification is ambiguous
    Generic,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Domain::Code => "code",
            Domain::Analysis => "analysis",
            Domain::Writing => "writing",
            Domain::Research => "research",
            Domain::Generic => "generic",
        };
        write!(f, "{name}")
    }
}

/// Effort tier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Single-pass, minimal structure
    Basic,
    /// Default staged pipeline
    Standard,
    /// Multi-branch pipeline with refinement
    Advanced,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::Advanced => "advanced",
        };
        write!(f, "{name}")
    }
}

/// A unit of work submitted to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Task {
    /// Free-text intent
    pub intent: String,

    /// Explicit domain override; skips classification when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,

    /// Explicit tier override; skips classification when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,

    /// Caller-supplied metadata, preserved through the pipeline
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, String>,
}

impl Task {
    /// Create a task from free-text intent
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            domain: None,
            tier: None,
            metadata: IndexMap::new(),
        }
    }

    /// The identity task: empty intent, no overrides
    ///
    /// Maps to the identity pipeline spec under the prompt functor.
    pub fn identity() -> Self {
        Self::new("")
    }

    /// True when this is the identity task
    pub fn is_identity(&self) -> bool {
        self.intent.is_empty() && self.domain.is_none() && self.tier.is_none()
    }

    /// Set an explicit domain override
    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Set an explicit tier override
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of classifying a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Classified domain
    pub domain: Domain,
    /// Classified tier
    pub tier: Tier,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
}

impl Classification {
    /// The fallback classification used when confidence is too low
    pub fn generic(confidence: f64) -> Self {
        Self {
            domain: Domain::Generic,
            tier: Tier::Standard,
            confidence,
        }
    }
}

/// Collaborator that classifies tasks
///
/// Implemented externally; the core only consumes the verdict. A low
/// confidence value is not an error - the prompt functor falls back to
/// [`Domain::Generic`] and records the confidence in spec metadata.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a task into a domain/tier with a confidence score
    async fn classify(&self, task: &Task) -> EngineResult<Classification>;
}

/// Classifier returning a fixed verdict, for tests and as a default
#[derive(Debug, Clone)]
pub struct StaticClassifier {
    verdict: Classification,
}

impl StaticClassifier {
    /// Create a classifier that always returns the given verdict
    pub fn new(verdict: Classification) -> Self {
        Self { verdict }
    }

    /// Classifier that always reports the generic domain at full confidence
    pub fn generic() -> Self {
        Self::new(Classification::generic(1.0))
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    async fn classify(&self, _task: &Task) -> EngineResult<Classification> {
        Ok(self.verdict.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_task_round_trips() {
        let task = Task::identity();
        assert!(task.is_identity());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn overrides_break_identity() {
        let task = Task::new("").with_domain(Domain::Code);
        assert!(!task.is_identity());
    }

    #[tokio::test]
    async fn static_classifier_returns_fixed_verdict() {
        let classifier = StaticClassifier::new(Classification {
            domain: Domain::Analysis,
            tier: Tier::Advanced,
            confidence: 0.92,
        });

        let verdict = classifier.classify(&Task::new("inspect logs")).await.unwrap();
        assert_eq!(verdict.domain, Domain::Analysis);
        assert_eq!(verdict.tier, Tier::Advanced);
    }
}

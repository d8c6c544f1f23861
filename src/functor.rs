// Copyright 2025 Cowboy AI, LLC.

//! PromptFunctor - structure-preserving map from tasks to pipeline plans
//!
//! The functor maps the category of tasks (objects: tasks, composition:
//! sequencing of intents) into the category of pipeline plans (objects:
//! staged plans, composition: plan concatenation). The laws:
//!
//! 1. Identity: `map(identity_task) = identity_plan`
//! 2. Composition: `map(g ∘ f) = map(g) ∘ map(f)`
//!
//! Stage selection is table-driven: an immutable [`PromptRegistry`] value
//! injected at construction maps `(domain, tier)` to an ordered stage
//! plan. Classification is delegated to an external [`Classifier`]; a
//! low-confidence verdict falls back to the generic plan with the
//! confidence recorded in metadata, never an error.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{EngineResult, PipelineError};
use crate::spec::{CompositionNode, CompositionSpec};
use crate::task::{Classifier, Domain, Task, Tier};

/// Classifier confidence below which the functor falls back to generic
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.5;

/// An ordered staged-pipeline description, the functor's codomain object
///
/// Plans form a monoid under [`PipelinePlan::then`] with the identity
/// plan as unit; the functor maps task composition onto it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelinePlan {
    /// Ordered stage names
    pub stages: Vec<String>,
    /// Plan annotations (classification confidence lands here)
    pub metadata: IndexMap<String, String>,
}

impl PipelinePlan {
    /// A plan over ordered stage names
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            metadata: IndexMap::new(),
        }
    }

    /// The identity plan: no stages, no annotations
    pub fn identity() -> Self {
        Self::default()
    }

    /// True when this is the identity plan
    pub fn is_identity(&self) -> bool {
        self.stages.is_empty() && self.metadata.is_empty()
    }

    /// Plan composition: this plan followed by `next`
    ///
    /// Associative, with [`PipelinePlan::identity`] as two-sided unit.
    /// Metadata merges left to right; later entries win on key collision.
    pub fn then(mut self, next: PipelinePlan) -> PipelinePlan {
        self.stages.extend(next.stages);
        for (key, value) in next.metadata {
            self.metadata.insert(key, value);
        }
        self
    }

    /// Lower the plan to an executable composition spec
    ///
    /// Quality gating per stage is the point of a plan, so stages become
    /// a KLEISLI chain; the identity plan lowers to the identity spec.
    pub fn into_spec(self) -> CompositionSpec {
        if self.stages.is_empty() {
            let mut spec = CompositionSpec::identity();
            spec.metadata = self.metadata;
            return spec;
        }
        let children = self
            .stages
            .into_iter()
            .map(CompositionNode::stage)
            .collect();
        let mut spec = CompositionSpec::new(CompositionNode::Kleisli { children });
        spec.metadata = self.metadata;
        spec
    }
}

/// Immutable `(domain, tier)` → stage plan table
///
/// Constructed once and injected into the functor; no global registry
/// state exists anywhere in the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRegistry {
    plans: IndexMap<(Domain, Tier), Vec<String>>,
}

impl PromptRegistry {
    /// An empty registry; every lookup falls back to the generic plan
    pub fn empty() -> Self {
        Self {
            plans: IndexMap::new(),
        }
    }

    /// Register a stage plan for a domain/tier pair
    pub fn with_plan<I, S>(mut self, domain: Domain, tier: Tier, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plans
            .insert((domain, tier), stages.into_iter().map(Into::into).collect());
        self
    }

    /// The plan for a domain/tier pair, falling back per tier within the
    /// domain and finally to the generic domain
    pub fn plan_for(&self, domain: Domain, tier: Tier) -> PipelinePlan {
        let lookup = [
            (domain, tier),
            (domain, Tier::Standard),
            (Domain::Generic, tier),
            (Domain::Generic, Tier::Standard),
        ];
        for key in lookup {
            if let Some(stages) = self.plans.get(&key) {
                return PipelinePlan::new(stages.clone());
            }
        }
        PipelinePlan::new(["draft", "review"])
    }
}

impl Default for PromptRegistry {
    /// The built-in plan table
    fn default() -> Self {
        Self::empty()
            .with_plan(
                Domain::Code,
                Tier::Basic,
                ["implement"],
            )
            .with_plan(
                Domain::Code,
                Tier::Standard,
                ["understand", "implement", "verify"],
            )
            .with_plan(
                Domain::Code,
                Tier::Advanced,
                ["understand", "design", "implement", "test", "verify"],
            )
            .with_plan(
                Domain::Analysis,
                Tier::Standard,
                ["gather", "analyze", "conclude"],
            )
            .with_plan(
                Domain::Analysis,
                Tier::Advanced,
                ["gather", "decompose", "analyze", "cross-check", "conclude"],
            )
            .with_plan(
                Domain::Writing,
                Tier::Standard,
                ["outline", "draft", "edit"],
            )
            .with_plan(
                Domain::Research,
                Tier::Standard,
                ["search", "synthesize", "cite"],
            )
            .with_plan(Domain::Generic, Tier::Basic, ["draft"])
            .with_plan(Domain::Generic, Tier::Standard, ["draft", "review"])
            .with_plan(
                Domain::Generic,
                Tier::Advanced,
                ["draft", "critique", "revise"],
            )
    }
}

/// Maps tasks to pipeline plans through classification and the registry
#[derive(Clone)]
pub struct PromptFunctor {
    registry: PromptRegistry,
    classifier: Arc<dyn Classifier>,
    confidence_floor: f64,
}

impl PromptFunctor {
    /// Create a functor over an immutable registry and a classifier
    pub fn new(registry: PromptRegistry, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            registry,
            classifier,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
        }
    }

    /// Override the classification confidence floor
    pub fn with_confidence_floor(mut self, floor: f64) -> Self {
        self.confidence_floor = floor.clamp(0.0, 1.0);
        self
    }

    /// Map one task to its pipeline plan
    ///
    /// The identity task maps to the identity plan. Explicit overrides on
    /// the task skip classification entirely; a verdict below the
    /// confidence floor falls back to the generic domain with the
    /// confidence recorded in plan metadata.
    pub async fn map(&self, task: &Task) -> EngineResult<PipelinePlan> {
        if task.is_identity() {
            return Ok(PipelinePlan::identity());
        }

        let (domain, tier) = match (task.domain, task.tier) {
            (Some(domain), Some(tier)) => (domain, tier),
            _ => {
                let verdict = self.classifier.classify(task).await.map_err(|e| {
                    PipelineError::ClassificationAmbiguous(e.to_string())
                })?;
                if !(0.0..=1.0).contains(&verdict.confidence) {
                    return Err(PipelineError::ClassificationAmbiguous(format!(
                        "confidence {} outside [0, 1]",
                        verdict.confidence
                    )));
                }
                if verdict.confidence < self.confidence_floor {
                    // an explicit override outranks the weak verdict
                    let fallback_domain = task.domain.unwrap_or(Domain::Generic);
                    debug!(
                        confidence = verdict.confidence,
                        floor = self.confidence_floor,
                        domain = %fallback_domain,
                        "low-confidence classification, falling back"
                    );
                    let mut plan = self
                        .registry
                        .plan_for(fallback_domain, task.tier.unwrap_or(Tier::Standard));
                    plan.metadata.insert(
                        "classification_confidence".into(),
                        format!("{:.3}", verdict.confidence),
                    );
                    plan.metadata.insert(
                        "classification_fallback".into(),
                        fallback_domain.to_string(),
                    );
                    return Ok(plan);
                }
                (
                    task.domain.unwrap_or(verdict.domain),
                    task.tier.unwrap_or(verdict.tier),
                )
            }
        };

        debug!(%domain, %tier, "task mapped to plan");
        Ok(self.registry.plan_for(domain, tier))
    }

    /// Map a composite task, given as the sequence of its factors
    ///
    /// Folding [`PipelinePlan::then`] over the per-factor images gives
    /// the image of the composition, so mapping factors separately and
    /// composing equals mapping the composite.
    pub async fn map_composed(&self, tasks: &[Task]) -> EngineResult<PipelinePlan> {
        let mut plan = PipelinePlan::identity();
        for task in tasks {
            plan = plan.then(self.map(task).await?);
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Classification, StaticClassifier};

    fn functor(confidence: f64) -> PromptFunctor {
        PromptFunctor::new(
            PromptRegistry::default(),
            Arc::new(StaticClassifier::new(Classification {
                domain: Domain::Code,
                tier: Tier::Standard,
                confidence,
            })),
        )
    }

    #[tokio::test]
    async fn identity_task_maps_to_identity_plan() {
        let plan = functor(1.0).map(&Task::identity()).await.unwrap();
        assert!(plan.is_identity());
        assert!(plan.into_spec().validate().is_ok());
    }

    #[tokio::test]
    async fn composition_of_plans_matches_plan_of_composition() {
        let functor = functor(0.9);
        let f = Task::new("draft module").with_domain(Domain::Code).with_tier(Tier::Basic);
        let g = Task::new("polish prose")
            .with_domain(Domain::Writing)
            .with_tier(Tier::Standard);

        let composed = functor.map_composed(&[f.clone(), g.clone()]).await.unwrap();
        let separate = functor
            .map(&f)
            .await
            .unwrap()
            .then(functor.map(&g).await.unwrap());

        assert_eq!(composed, separate);
    }

    #[tokio::test]
    async fn identity_plan_is_a_two_sided_unit() {
        let functor = functor(0.9);
        let task = Task::new("analyze")
            .with_domain(Domain::Analysis)
            .with_tier(Tier::Standard);
        let plan = functor.map(&task).await.unwrap();

        assert_eq!(plan.clone().then(PipelinePlan::identity()), plan);
        assert_eq!(PipelinePlan::identity().then(plan.clone()), plan);
    }

    #[tokio::test]
    async fn explicit_overrides_skip_classification() {
        // classifier would say Code/Standard; overrides must win
        let plan = functor(1.0)
            .map(
                &Task::new("write docs")
                    .with_domain(Domain::Writing)
                    .with_tier(Tier::Standard),
            )
            .await
            .unwrap();
        assert_eq!(plan.stages, vec!["outline", "draft", "edit"]);
    }

    #[tokio::test]
    async fn low_confidence_falls_back_to_generic_with_metadata() {
        let plan = functor(0.3).map(&Task::new("do something")).await.unwrap();

        assert_eq!(plan.stages, vec!["draft", "review"]);
        assert_eq!(
            plan.metadata.get("classification_confidence").map(String::as_str),
            Some("0.300")
        );
        assert_eq!(
            plan.metadata.get("classification_fallback").map(String::as_str),
            Some("generic")
        );
    }

    #[tokio::test]
    async fn low_confidence_fallback_keeps_an_explicit_domain() {
        // classifier would say Code at confidence 0.3; the caller already
        // pinned the domain, so only the tier falls back
        let plan = functor(0.3)
            .map(&Task::new("tidy the prose").with_domain(Domain::Writing))
            .await
            .unwrap();

        assert_eq!(plan.stages, vec!["outline", "draft", "edit"]);
        assert_eq!(
            plan.metadata.get("classification_fallback").map(String::as_str),
            Some("writing")
        );
    }

    #[tokio::test]
    async fn plans_lower_to_kleisli_specs() {
        let plan = functor(0.9)
            .map(&Task::new("fix bug").with_domain(Domain::Code).with_tier(Tier::Standard))
            .await
            .unwrap();
        let spec = plan.into_spec();
        spec.validate().unwrap();
        assert!(matches!(spec.root, CompositionNode::Kleisli { .. }));
        assert_eq!(spec.leaf_count().unwrap(), 3);
    }

    #[test]
    fn registry_lookup_degrades_gracefully() {
        let registry = PromptRegistry::default();
        // Writing has no Advanced plan; falls back within the domain
        assert_eq!(
            registry.plan_for(Domain::Writing, Tier::Advanced).stages,
            vec!["outline", "draft", "edit"]
        );
        // empty registry still produces a usable plan
        assert_eq!(
            PromptRegistry::empty().plan_for(Domain::Code, Tier::Basic).stages,
            vec!["draft", "review"]
        );
    }
}

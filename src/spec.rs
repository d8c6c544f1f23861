// Copyright 2025 Cowboy AI, LLC.

//! Composition specs: the operator tree and its modifiers
//!
//! A [`CompositionSpec`] is an explicit, acyclic tree of composition
//! operators over named stage leaves. Chains may reference other chains
//! through named definitions; references are resolved and cycle-checked at
//! parse time, so evaluation never recurses unboundedly.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::Budget;
use crate::errors::{EngineResult, PipelineError};

/// Upper bound on retry attempts accepted by validation
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Error-recovery policy applied when a node fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CatchPolicy {
    /// Propagate the failure to the parent (default)
    Halt,
    /// Record the failure, treat the stage as quality zero, continue
    Log,
    /// Re-invoke with bounded backoff up to N attempts
    Retry(u32),
    /// Omit the stage; the parent's quality formula adjusts over the rest
    Skip,
    /// Use the stage's caller-provided substitute value
    Substitute,
}

impl Default for CatchPolicy {
    fn default() -> Self {
        CatchPolicy::Halt
    }
}

impl std::str::FromStr for CatchPolicy {
    type Err = PipelineError;

    /// Parse the `halt|log|retry:N|skip|substitute` shorthand
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt" => Ok(CatchPolicy::Halt),
            "log" => Ok(CatchPolicy::Log),
            "skip" => Ok(CatchPolicy::Skip),
            "substitute" => Ok(CatchPolicy::Substitute),
            other => {
                if let Some(n) = other.strip_prefix("retry:") {
                    let attempts: u32 = n.parse().map_err(|_| {
                        PipelineError::validation(format!("invalid retry count in '{other}'"))
                    })?;
                    Ok(CatchPolicy::Retry(attempts))
                } else {
                    Err(PipelineError::validation(format!(
                        "unknown catch policy '{other}'"
                    )))
                }
            }
        }
    }
}

/// What a refinement loop returns when it terminates without converging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Best-seen candidate by aggregate quality (default)
    ReturnBest,
    /// The last candidate, even if it regressed
    ReturnLast,
    /// The caller-provided default value
    UseDefault,
    /// A null value with zero quality
    Empty,
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        FallbackStrategy::ReturnBest
    }
}

/// Caller-facing evaluation modifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(default)]
pub struct PipelineModifiers {
    /// Aggregate quality at which refinement converges, in [0, 1]
    pub quality_threshold: f64,
    /// Refinement pass cap, in [1, 10]
    pub max_iterations: u32,
    /// Budget allocation: total, per-branch, or auto
    pub budget: Budget,
    /// Default catch policy for nodes that declare none
    pub catch: CatchPolicy,
    /// Non-convergence fallback
    pub fallback: FallbackStrategy,
    /// Minimum aggregate delta that still counts as improvement
    pub plateau_epsilon: f64,
    /// Allowed budget overrun percentage before a soft halt
    pub variance_threshold_pct: f64,
    /// Minimum surviving branches for a PARALLEL mean to be meaningful
    pub min_parallel_branches: usize,
    /// Observation history retention cap
    pub history_cap: usize,
    /// Wall-clock limit per spawned branch; in-flight branches are
    /// cancelled when it elapses
    pub branch_timeout_ms: Option<u64>,
    /// Value used by [`FallbackStrategy::UseDefault`]
    pub default_value: Option<Value>,
}

impl Default for PipelineModifiers {
    fn default() -> Self {
        Self {
            quality_threshold: 0.8,
            max_iterations: 5,
            budget: Budget::auto(),
            catch: CatchPolicy::Halt,
            fallback: FallbackStrategy::ReturnBest,
            plateau_epsilon: 0.02,
            variance_threshold_pct: crate::budget::DEFAULT_VARIANCE_THRESHOLD_PCT,
            min_parallel_branches: 1,
            history_cap: crate::comonad::DEFAULT_HISTORY_CAP,
            branch_timeout_ms: None,
            default_value: None,
        }
    }
}

impl PipelineModifiers {
    /// Validate ranges before evaluation begins
    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(PipelineError::validation(
                "quality_threshold must lie in [0, 1]",
            ));
        }
        if !(1..=10).contains(&self.max_iterations) {
            return Err(PipelineError::validation(
                "max_iterations must lie in [1, 10]",
            ));
        }
        if self.plateau_epsilon <= 0.0 || self.plateau_epsilon >= 1.0 {
            return Err(PipelineError::validation(
                "plateau_epsilon must lie in (0, 1)",
            ));
        }
        if self.min_parallel_branches == 0 {
            return Err(PipelineError::validation(
                "min_parallel_branches must be at least 1",
            ));
        }
        Ok(())
    }
}

/// One node of the composition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CompositionNode {
    /// Leaf: an opaque stage executor reference
    Stage {
        /// Registered executor name
        name: String,
        /// Node-local catch policy override
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch: Option<CatchPolicy>,
        /// Fallback value for [`CatchPolicy::Substitute`]
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substitute: Option<Value>,
    },
    /// Execute children left to right, threading outputs
    Sequence {
        /// Ordered children
        children: Vec<CompositionNode>,
    },
    /// Execute children concurrently; mean quality, merged outputs
    Parallel {
        /// Ordered children (declaration order fixes checkpoint merging)
        children: Vec<CompositionNode>,
    },
    /// Execute children concurrently; all must succeed, min quality
    Tensor {
        /// Ordered children
        children: Vec<CompositionNode>,
    },
    /// Sequential chain with per-stage quality-gated refinement
    Kleisli {
        /// Ordered children
        children: Vec<CompositionNode>,
    },
    /// Reference to a named definition, resolved at parse time
    Ref {
        /// Definition name
        name: String,
    },
}

impl CompositionNode {
    /// Leaf constructor without overrides
    pub fn stage(name: impl Into<String>) -> Self {
        CompositionNode::Stage {
            name: name.into(),
            catch: None,
            substitute: None,
        }
    }

    /// Number of stage leaves after resolution (references not counted)
    fn leaf_count(&self) -> usize {
        match self {
            CompositionNode::Stage { .. } => 1,
            CompositionNode::Ref { .. } => 0,
            CompositionNode::Sequence { children }
            | CompositionNode::Parallel { children }
            | CompositionNode::Tensor { children }
            | CompositionNode::Kleisli { children } => {
                children.iter().map(CompositionNode::leaf_count).sum()
            }
        }
    }
}

/// A complete, validated composition spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CompositionSpec {
    /// The operator tree
    pub root: CompositionNode,
    /// Named subtrees referencable via [`CompositionNode::Ref`]
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub definitions: IndexMap<String, CompositionNode>,
    /// Evaluation modifiers
    #[serde(default)]
    pub modifiers: PipelineModifiers,
    /// Free-form annotations (classification confidence lands here)
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, String>,
}

impl CompositionSpec {
    /// Create a spec from a root node with default modifiers
    pub fn new(root: CompositionNode) -> Self {
        Self {
            root,
            definitions: IndexMap::new(),
            modifiers: PipelineModifiers::default(),
            metadata: IndexMap::new(),
        }
    }

    /// The identity spec: an empty sequence that passes input through
    pub fn identity() -> Self {
        Self::new(CompositionNode::Sequence {
            children: Vec::new(),
        })
    }

    /// Parse a spec from JSON and validate it
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let spec: CompositionSpec = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Register a named subtree
    pub fn with_definition(mut self, name: impl Into<String>, node: CompositionNode) -> Self {
        self.definitions.insert(name.into(), node);
        self
    }

    /// Override the modifiers
    pub fn with_modifiers(mut self, modifiers: PipelineModifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Validate structure, modifiers and reference acyclicity
    pub fn validate(&self) -> EngineResult<()> {
        self.modifiers.validate()?;
        self.check_node(&self.root, &mut Vec::new())?;
        for (name, node) in &self.definitions {
            self.check_node(node, &mut vec![name.clone()])?;
        }
        Ok(())
    }

    fn check_node(&self, node: &CompositionNode, visiting: &mut Vec<String>) -> EngineResult<()> {
        match node {
            CompositionNode::Stage { name, catch, .. } => {
                if name.is_empty() {
                    return Err(PipelineError::validation("stage name must not be empty"));
                }
                if let Some(CatchPolicy::Retry(attempts)) = catch {
                    if *attempts == 0 || *attempts > MAX_RETRY_ATTEMPTS {
                        return Err(PipelineError::validation(format!(
                            "retry attempts must lie in [1, {MAX_RETRY_ATTEMPTS}]"
                        )));
                    }
                }
                Ok(())
            }
            CompositionNode::Sequence { children } => {
                // An empty sequence is the identity pipeline
                for child in children {
                    self.check_node(child, visiting)?;
                }
                Ok(())
            }
            CompositionNode::Parallel { children }
            | CompositionNode::Tensor { children }
            | CompositionNode::Kleisli { children } => {
                if children.is_empty() {
                    return Err(PipelineError::validation(
                        "parallel, tensor and kleisli nodes need at least one child",
                    ));
                }
                for child in children {
                    self.check_node(child, visiting)?;
                }
                Ok(())
            }
            CompositionNode::Ref { name } => {
                if visiting.iter().any(|v| v == name) {
                    return Err(PipelineError::CyclicSpec(name.clone()));
                }
                let target = self.definitions.get(name).ok_or_else(|| {
                    PipelineError::validation(format!("unknown composition reference '{name}'"))
                })?;
                visiting.push(name.clone());
                let result = self.check_node(target, visiting);
                visiting.pop();
                result
            }
        }
    }

    /// The root with every reference inlined
    ///
    /// Callers should validate first; resolution shares the cycle check.
    pub fn resolved_root(&self) -> EngineResult<CompositionNode> {
        self.resolve(&self.root, &mut Vec::new())
    }

    fn resolve(
        &self,
        node: &CompositionNode,
        visiting: &mut Vec<String>,
    ) -> EngineResult<CompositionNode> {
        let resolved = match node {
            CompositionNode::Stage { .. } => node.clone(),
            CompositionNode::Ref { name } => {
                if visiting.iter().any(|v| v == name) {
                    return Err(PipelineError::CyclicSpec(name.clone()));
                }
                let target = self.definitions.get(name).ok_or_else(|| {
                    PipelineError::validation(format!("unknown composition reference '{name}'"))
                })?;
                visiting.push(name.clone());
                let inlined = self.resolve(target, visiting)?;
                visiting.pop();
                inlined
            }
            CompositionNode::Sequence { children } => CompositionNode::Sequence {
                children: self.resolve_children(children, visiting)?,
            },
            CompositionNode::Parallel { children } => CompositionNode::Parallel {
                children: self.resolve_children(children, visiting)?,
            },
            CompositionNode::Tensor { children } => CompositionNode::Tensor {
                children: self.resolve_children(children, visiting)?,
            },
            CompositionNode::Kleisli { children } => CompositionNode::Kleisli {
                children: self.resolve_children(children, visiting)?,
            },
        };
        Ok(resolved)
    }

    fn resolve_children(
        &self,
        children: &[CompositionNode],
        visiting: &mut Vec<String>,
    ) -> EngineResult<Vec<CompositionNode>> {
        children
            .iter()
            .map(|c| self.resolve(c, visiting))
            .collect()
    }

    /// Number of stage leaves in the resolved tree; drives the auto budget
    pub fn leaf_count(&self) -> EngineResult<usize> {
        Ok(self.resolved_root()?.leaf_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn catch_policy_shorthand_parses() {
        assert_eq!(CatchPolicy::from_str("halt").unwrap(), CatchPolicy::Halt);
        assert_eq!(
            CatchPolicy::from_str("retry:3").unwrap(),
            CatchPolicy::Retry(3)
        );
        assert!(CatchPolicy::from_str("retry:x").is_err());
        assert!(CatchPolicy::from_str("explode").is_err());
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = CompositionSpec::new(CompositionNode::Sequence {
            children: vec![
                CompositionNode::stage("draft"),
                CompositionNode::Parallel {
                    children: vec![
                        CompositionNode::stage("review-a"),
                        CompositionNode::stage("review-b"),
                    ],
                },
            ],
        });

        let json = serde_json::to_string(&spec).unwrap();
        let back = CompositionSpec::from_json(&json).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn cyclic_references_are_rejected_at_parse_time() {
        let spec = CompositionSpec::new(CompositionNode::Ref {
            name: "chain-a".into(),
        })
        .with_definition(
            "chain-a",
            CompositionNode::Sequence {
                children: vec![
                    CompositionNode::stage("draft"),
                    CompositionNode::Ref {
                        name: "chain-b".into(),
                    },
                ],
            },
        )
        .with_definition(
            "chain-b",
            CompositionNode::Ref {
                name: "chain-a".into(),
            },
        );

        let err = spec.validate().unwrap_err();
        assert!(matches!(err, PipelineError::CyclicSpec(_)));
    }

    #[test]
    fn self_reference_is_cyclic() {
        let spec = CompositionSpec::new(CompositionNode::Ref { name: "me".into() })
            .with_definition("me", CompositionNode::Ref { name: "me".into() });
        assert!(matches!(
            spec.validate().unwrap_err(),
            PipelineError::CyclicSpec(_)
        ));
    }

    #[test]
    fn unknown_reference_is_a_validation_error() {
        let spec = CompositionSpec::new(CompositionNode::Ref {
            name: "ghost".into(),
        });
        assert!(matches!(
            spec.validate().unwrap_err(),
            PipelineError::Validation(_)
        ));
    }

    #[test]
    fn references_inline_into_the_resolved_tree() {
        let spec = CompositionSpec::new(CompositionNode::Sequence {
            children: vec![
                CompositionNode::stage("draft"),
                CompositionNode::Ref {
                    name: "review".into(),
                },
            ],
        })
        .with_definition(
            "review",
            CompositionNode::Tensor {
                children: vec![
                    CompositionNode::stage("review-a"),
                    CompositionNode::stage("review-b"),
                ],
            },
        );

        spec.validate().unwrap();
        let resolved = spec.resolved_root().unwrap();
        match resolved {
            CompositionNode::Sequence { children } => {
                assert!(matches!(children[1], CompositionNode::Tensor { .. }));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
        assert_eq!(spec.leaf_count().unwrap(), 3);
    }

    #[test]
    fn empty_composite_nodes_are_rejected() {
        let spec = CompositionSpec::new(CompositionNode::Parallel {
            children: Vec::new(),
        });
        assert!(spec.validate().is_err());

        // empty sequence is the identity and passes
        CompositionSpec::identity().validate().unwrap();
    }

    #[test]
    fn modifier_ranges_are_enforced() {
        let mut modifiers = PipelineModifiers {
            max_iterations: 11,
            ..PipelineModifiers::default()
        };
        assert!(modifiers.validate().is_err());

        modifiers.max_iterations = 5;
        modifiers.quality_threshold = 1.4;
        assert!(modifiers.validate().is_err());

        modifiers.quality_threshold = 0.8;
        modifiers.validate().unwrap();
    }

    #[test]
    fn oversized_retry_is_rejected() {
        let spec = CompositionSpec::new(CompositionNode::Stage {
            name: "draft".into(),
            catch: Some(CatchPolicy::Retry(99)),
            substitute: None,
        });
        assert!(spec.validate().is_err());
    }
}

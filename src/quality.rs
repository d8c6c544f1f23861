// Copyright 2025 Cowboy AI, LLC.

//! Quality vectors, weights and assessment
//!
//! Every stage output is scored across four fixed dimensions - correctness,
//! clarity, completeness, efficiency - and collapsed into a weighted
//! aggregate bounded to [0, 1]. Weights are configuration with a documented
//! default, not an immutable law; the sum-to-one invariant is enforced.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineResult, PipelineError};
use crate::task::Task;

/// Weight tolerance when checking the sum-to-one invariant
const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

/// Per-dimension weights for the quality aggregate
///
/// Weights must each lie in [0, 1] and sum to 1.0. The default split
/// (0.40 / 0.25 / 0.20 / 0.15) matches the documented assessment policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct QualityWeights {
    /// Weight of the correctness dimension
    pub correctness: f64,
    /// Weight of the clarity dimension
    pub clarity: f64,
    /// Weight of the completeness dimension
    pub completeness: f64,
    /// Weight of the efficiency dimension
    pub efficiency: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            correctness: 0.40,
            clarity: 0.25,
            completeness: 0.20,
            efficiency: 0.15,
        }
    }
}

impl QualityWeights {
    /// Validate the sum-to-one invariant and per-weight bounds
    pub fn validate(&self) -> EngineResult<()> {
        let weights = [
            self.correctness,
            self.clarity,
            self.completeness,
            self.efficiency,
        ];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(PipelineError::validation(
                "quality weights must each lie in [0, 1]",
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PipelineError::validation(format!(
                "quality weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// A bounded quality score across the four fixed dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct QualityVector {
    /// Factual/structural soundness of the output
    pub correctness: f64,
    /// Readability and coherence
    pub clarity: f64,
    /// Coverage of what the task asked for
    pub completeness: f64,
    /// Economy of the output
    pub efficiency: f64,
    /// Weighted aggregate, clamped to [0, 1]
    pub aggregate: f64,
}

impl QualityVector {
    /// Build a vector from raw dimensions using the default weights
    ///
    /// Dimensions are clamped to [0, 1] before aggregation.
    pub fn new(correctness: f64, clarity: f64, completeness: f64, efficiency: f64) -> Self {
        Self::with_weights(
            correctness,
            clarity,
            completeness,
            efficiency,
            &QualityWeights::default(),
        )
    }

    /// Build a vector from raw dimensions with explicit weights
    ///
    /// The caller is responsible for validating the weights; see
    /// [`QualityWeights::validate`].
    pub fn with_weights(
        correctness: f64,
        clarity: f64,
        completeness: f64,
        efficiency: f64,
        weights: &QualityWeights,
    ) -> Self {
        let correctness = clamp_unit(correctness);
        let clarity = clamp_unit(clarity);
        let completeness = clamp_unit(completeness);
        let efficiency = clamp_unit(efficiency);
        let aggregate = clamp_unit(
            weights.correctness * correctness
                + weights.clarity * clarity
                + weights.completeness * completeness
                + weights.efficiency * efficiency,
        );
        Self {
            correctness,
            clarity,
            completeness,
            efficiency,
            aggregate,
        }
    }

    /// Uniform vector where every dimension equals `q`
    pub fn uniform(q: f64) -> Self {
        Self::new(q, q, q, q)
    }

    /// The neutral vector: all dimensions at 1.0
    ///
    /// Used for the identity pipeline, which cannot degrade its input.
    pub fn perfect() -> Self {
        Self::uniform(1.0)
    }

    /// The zero vector, used when a failed stage is logged and skipped over
    pub fn zero() -> Self {
        Self::uniform(0.0)
    }

    /// Dimension-wise minimum (SEQUENCE / TENSOR propagation)
    ///
    /// An empty slice yields [`QualityVector::perfect`].
    pub fn min_of(vectors: &[QualityVector]) -> QualityVector {
        vectors.iter().fold(QualityVector::perfect(), |acc, v| {
            QualityVector::new(
                acc.correctness.min(v.correctness),
                acc.clarity.min(v.clarity),
                acc.completeness.min(v.completeness),
                acc.efficiency.min(v.efficiency),
            )
        })
    }

    /// Dimension-wise mean (PARALLEL propagation)
    ///
    /// An empty slice yields [`QualityVector::perfect`].
    pub fn mean_of(vectors: &[QualityVector]) -> QualityVector {
        if vectors.is_empty() {
            return QualityVector::perfect();
        }
        let n = vectors.len() as f64;
        QualityVector::new(
            vectors.iter().map(|v| v.correctness).sum::<f64>() / n,
            vectors.iter().map(|v| v.clarity).sum::<f64>() / n,
            vectors.iter().map(|v| v.completeness).sum::<f64>() / n,
            vectors.iter().map(|v| v.efficiency).sum::<f64>() / n,
        )
    }

    /// Signed aggregate delta against a previous vector
    pub fn delta_from(&self, previous: &QualityVector) -> f64 {
        self.aggregate - previous.aggregate
    }
}

/// Scores stage outputs into [`QualityVector`]s
///
/// Implementations must be pure and deterministic for identical inputs;
/// reproducible pipeline results depend on it.
pub trait QualityAssessor: Send + Sync {
    /// Raw dimension scores for an output, each in [0, 1], ordered
    /// correctness / clarity / completeness / efficiency
    fn dimensions(&self, output: &Value, task: &Task) -> [f64; 4];

    /// Assess an output using the default weights
    fn assess(&self, output: &Value, task: &Task) -> QualityVector {
        let [c, cl, co, e] = self.dimensions(output, task);
        QualityVector::new(c, cl, co, e)
    }

    /// Assess an output with an explicit, validated weight map
    fn assess_with_weights(
        &self,
        output: &Value,
        task: &Task,
        weights: &QualityWeights,
    ) -> EngineResult<QualityVector> {
        weights.validate()?;
        let [c, cl, co, e] = self.dimensions(output, task);
        Ok(QualityVector::with_weights(c, cl, co, e, weights))
    }
}

/// Deterministic structural heuristics over JSON outputs
///
/// Suitable as a default collaborator and for reproducible tests. Scores
/// depend only on the output value and the task intent.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAssessor;

impl HeuristicAssessor {
    fn rendered(output: &Value) -> String {
        match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl QualityAssessor for HeuristicAssessor {
    fn dimensions(&self, output: &Value, task: &Task) -> [f64; 4] {
        let text = Self::rendered(output);
        let len = text.chars().count();

        // Correctness: penalize empty output and explicit error markers
        let correctness = if len == 0 || output.is_null() {
            0.0
        } else if output.get("error").is_some() {
            0.2
        } else {
            (len as f64 / 32.0).min(1.0)
        };

        // Clarity: average sentence length in a readable band
        let sentences = text.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count();
        let words = text.split_whitespace().count();
        let clarity = if words == 0 {
            0.0
        } else {
            let avg = words as f64 / sentences.max(1) as f64;
            (30.0 - (avg - 15.0).abs()).max(0.0) / 30.0
        };

        // Completeness: coverage of the task's intent terms
        let lowered = text.to_lowercase();
        let terms: Vec<&str> = task
            .intent
            .split_whitespace()
            .filter(|t| t.len() > 3)
            .collect();
        let completeness = if terms.is_empty() {
            if len == 0 { 0.0 } else { 0.5 }
        } else {
            let hits = terms
                .iter()
                .filter(|t| lowered.contains(&t.to_lowercase()))
                .count();
            hits as f64 / terms.len() as f64
        };

        // Efficiency: economy of the output, tapering past 2048 chars
        let efficiency = if len == 0 {
            0.0
        } else if len <= 2048 {
            1.0
        } else {
            (2048.0 / len as f64).max(0.1)
        };

        [correctness, clarity, completeness, efficiency]
    }
}

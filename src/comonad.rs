// Copyright 2025 Cowboy AI, LLC.

//! Observation as COMONAD - history-aware context extraction
//!
//! An [`Observation`] wraps a value with its execution history, most
//! recent first. It forms a comonad (the nonempty-list / "tails"
//! construction) with:
//! - `extract`: read the focused value
//! - `duplicate`: re-focus on every point of the history
//! - `extend` (co-bind): run a history-aware function at every focus
//!
//! # Comonad Laws
//!
//! 1. Left Identity: `extract ∘ duplicate ≡ id`
//! 2. Right Identity: `fmap(extract) ∘ duplicate ≡ id`
//! 3. Coassociativity: `duplicate ∘ duplicate ≡ fmap(duplicate) ∘ duplicate`
//!
//! Observations are never mutated in place; every step produces a new
//! value. History depth is bounded (oldest dropped on append) so long
//! refinement runs keep memory flat.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default retention cap for observation history
pub const DEFAULT_HISTORY_CAP: usize = 32;

/// A value observed at a point in pipeline execution, with its history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation<T> {
    /// The focused value
    current: T,
    /// Execution context shared along the step chain
    context: IndexMap<String, serde_json::Value>,
    /// Prior values, most recent first, bounded by `history_cap`
    history: Vec<T>,
    /// Free-form annotations
    metadata: IndexMap<String, String>,
    /// Retention cap applied when a step is recorded
    history_cap: usize,
}

impl<T> Observation<T> {
    /// Create an observation of a value with empty history
    pub fn new(current: T) -> Self {
        Self {
            current,
            context: IndexMap::new(),
            history: Vec::new(),
            metadata: IndexMap::new(),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Override the history retention cap (minimum 1)
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    /// Attach a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// extract: read the focused value
    pub fn extract(&self) -> &T {
        &self.current
    }

    /// Consume the observation, yielding the focused value
    pub fn into_current(self) -> T {
        self.current
    }

    /// The execution context
    pub fn context(&self) -> &IndexMap<String, serde_json::Value> {
        &self.context
    }

    /// The metadata map
    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.metadata
    }

    /// Prior values, most recent first
    pub fn history(&self) -> &[T] {
        &self.history
    }

    /// The configured retention cap
    pub fn history_cap(&self) -> usize {
        self.history_cap
    }
}

impl<T: Clone> Observation<T> {
    /// Record a pipeline step: the new value becomes current and the old
    /// current is prepended to history, dropping the oldest entry past the
    /// retention cap. The original observation is untouched.
    pub fn step(&self, next: T) -> Observation<T> {
        let mut history = Vec::with_capacity((self.history.len() + 1).min(self.history_cap));
        history.push(self.current.clone());
        history.extend(self.history.iter().cloned());
        history.truncate(self.history_cap);
        Observation {
            current: next,
            context: self.context.clone(),
            history,
            metadata: self.metadata.clone(),
            history_cap: self.history_cap,
        }
    }

    /// map: Functor operation over the focus and every history entry
    pub fn map<U, F>(&self, f: F) -> Observation<U>
    where
        F: Fn(&T) -> U,
    {
        Observation {
            current: f(&self.current),
            context: self.context.clone(),
            history: self.history.iter().map(&f).collect(),
            metadata: self.metadata.clone(),
            history_cap: self.history_cap,
        }
    }

    /// duplicate: re-focus on the observation itself and on every suffix
    /// of its history
    ///
    /// Each history entry becomes an observation whose history is what was
    /// older than it, so `extend` sees at every focus exactly the past
    /// that focus had.
    pub fn duplicate(&self) -> Observation<Observation<T>> {
        let history = (0..self.history.len())
            .map(|k| Observation {
                current: self.history[k].clone(),
                context: self.context.clone(),
                history: self.history[k + 1..].to_vec(),
                metadata: self.metadata.clone(),
                history_cap: self.history_cap,
            })
            .collect();
        Observation {
            current: self.clone(),
            context: self.context.clone(),
            history,
            metadata: self.metadata.clone(),
            history_cap: self.history_cap,
        }
    }

    /// extend (co-bind): apply a history-aware function at every focus
    ///
    /// Equivalent to `fmap(f) ∘ duplicate`.
    pub fn extend<U, F>(&self, f: F) -> Observation<U>
    where
        F: Fn(&Observation<T>) -> U,
    {
        self.duplicate().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Observation<i32> {
        Observation::new(1)
            .with_context("run", serde_json::json!("alpha"))
            .step(2)
            .step(3)
    }

    #[test]
    fn step_is_append_only() {
        let obs = sample();
        assert_eq!(*obs.extract(), 3);
        assert_eq!(obs.history(), &[2, 1]);

        let next = obs.step(4);
        // original untouched
        assert_eq!(*obs.extract(), 3);
        assert_eq!(next.history(), &[3, 2, 1]);
    }

    #[test]
    fn retention_cap_drops_oldest() {
        let mut obs = Observation::new(0).with_history_cap(2);
        assert_eq!(obs.history_cap(), 2);
        for v in 1..6 {
            obs = obs.step(v);
        }
        assert_eq!(*obs.extract(), 5);
        assert_eq!(obs.history(), &[4, 3]);
        assert_eq!(obs.into_current(), 5);
    }

    #[test]
    fn extract_after_duplicate_is_identity() {
        let obs = sample();
        assert_eq!(*obs.duplicate().extract(), obs);
    }

    #[test]
    fn map_extract_after_duplicate_is_identity() {
        let obs = sample();
        let restored = obs.duplicate().map(|o| *o.extract());
        assert_eq!(restored, obs);
    }

    #[test]
    fn duplicate_is_coassociative() {
        let obs = sample();
        let left = obs.duplicate().duplicate();
        let right = obs.duplicate().map(|o| o.duplicate());
        assert_eq!(left, right);
    }

    #[test]
    fn extend_sees_the_past_at_every_focus() {
        let obs = sample();
        // Sum of the focus and everything older than it
        let summed = obs.extend(|o| o.extract() + o.history().iter().sum::<i32>());
        assert_eq!(*summed.extract(), 6); // 3+2+1
        assert_eq!(summed.history(), &[3, 1]); // 2+1, 1
    }
}

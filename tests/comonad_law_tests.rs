// Copyright (c) 2025 - Cowboy AI, LLC.

use proptest::prelude::*;

use prompt_pipeline::Observation;

fn observe(seed: i64, steps: &[i64]) -> Observation<i64> {
    steps
        .iter()
        .fold(Observation::new(seed), |obs, step| obs.step(*step))
}

proptest! {
    #[test]
    fn extract_after_duplicate_is_identity(seed in any::<i64>(),
                                           steps in proptest::collection::vec(any::<i64>(), 0..12)) {
        // extract ∘ duplicate ≡ id
        let obs = observe(seed, &steps);
        let duplicated = obs.duplicate();
        prop_assert_eq!(duplicated.extract(), &obs);
    }

    #[test]
    fn map_extract_after_duplicate_is_identity(seed in any::<i64>(),
                                               steps in proptest::collection::vec(any::<i64>(), 0..12)) {
        // fmap(extract) ∘ duplicate ≡ id
        let obs = observe(seed, &steps);
        let restored = obs.duplicate().map(|o| *o.extract());
        prop_assert_eq!(restored, obs);
    }

    #[test]
    fn duplicate_is_coassociative(seed in any::<i64>(),
                                  steps in proptest::collection::vec(any::<i64>(), 0..8)) {
        // duplicate ∘ duplicate ≡ fmap(duplicate) ∘ duplicate
        let obs = observe(seed, &steps);
        let left = obs.duplicate().duplicate();
        let right = obs.duplicate().map(|o| o.duplicate());
        prop_assert_eq!(left, right);
    }

    #[test]
    fn extend_agrees_with_its_definition(seed in any::<i64>(),
                                         steps in proptest::collection::vec(any::<i64>(), 0..12)) {
        // extend(f) ≡ fmap(f) ∘ duplicate
        let obs = observe(seed, &steps);
        let f = |o: &Observation<i64>| o.extract().wrapping_add(o.history().len() as i64);
        prop_assert_eq!(obs.extend(f), obs.duplicate().map(f));
    }

    #[test]
    fn history_never_exceeds_the_cap(seed in any::<i64>(),
                                     steps in proptest::collection::vec(any::<i64>(), 0..64),
                                     cap in 1usize..8) {
        let obs = steps
            .iter()
            .fold(Observation::new(seed).with_history_cap(cap), |o, s| o.step(*s));
        prop_assert!(obs.history().len() <= cap);
        if !steps.is_empty() {
            prop_assert_eq!(*obs.extract(), *steps.last().unwrap());
            // most recent first
            prop_assert_eq!(obs.history()[0], if steps.len() >= 2 { steps[steps.len() - 2] } else { seed });
        }
    }
}

#[test]
fn laws_hold_with_context_and_metadata_attached() {
    let obs = Observation::new(1)
        .with_context("intent", serde_json::json!("polish"))
        .with_metadata("origin", "test")
        .step(2)
        .step(3);

    assert_eq!(obs.duplicate().extract(), &obs);
    assert_eq!(obs.duplicate().map(|o| *o.extract()), obs);
    assert_eq!(
        obs.duplicate().duplicate(),
        obs.duplicate().map(|o| o.duplicate())
    );
}

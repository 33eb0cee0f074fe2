//! The learned energy model store.
//!
//! One [`EnergyModel`] instance exists per scope: a global whole-building
//! model plus one per tracked heating unit. The store is owned by the
//! learning manager; every other component receives a shared reference and
//! only reads.
//!
//! Each bucket carries the cold-start buffer. Until four raw samples have
//! been seen for a condition, samples accumulate in the buffer; the fourth
//! sample jump-starts the predicted value to the buffer mean, after which
//! the slow EMA takes over.

use crate::domain::{AuxState, ConditionKey, WindBucket};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Samples required before a bucket's prediction is jump-started.
pub const JUMP_START_SAMPLES: usize = 4;

/// One condition bucket's learned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub predicted: f64,
    pub observations: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffer: Vec<f64>,
}

impl BucketStats {
    pub fn new() -> Self {
        Self { predicted: 0.0, observations: 0, buffer: Vec::new() }
    }

    /// Seed a bucket with an already-trusted value, bypassing cold start.
    /// Used when a harsher wind bucket inherits a milder bucket's
    /// coefficient as its starting point.
    pub fn seeded(value: f64) -> Self {
        Self { predicted: value, observations: JUMP_START_SAMPLES as u32, buffer: Vec::new() }
    }

    /// Whether the bucket has a usable prediction.
    pub fn is_populated(&self) -> bool {
        self.observations as usize >= JUMP_START_SAMPLES
    }
}

impl Default for BucketStats {
    fn default() -> Self {
        Self::new()
    }
}

/// How a single observation was absorbed into a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbsorbOutcome {
    /// Sample buffered; prediction untouched.
    Buffered { pending: usize },
    /// Buffer filled; prediction set to the buffer mean.
    JumpStarted { mean: f64 },
    /// Steady-state EMA step.
    Updated { before: f64, after: f64 },
}

/// A per-scope mapping from condition to learned bucket state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyModel {
    buckets: BTreeMap<ConditionKey, BucketStats>,
}

impl EnergyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ConditionKey) -> Option<&BucketStats> {
        self.buckets.get(key)
    }

    /// Populated bucket at exactly this key, if any.
    pub fn populated(&self, key: &ConditionKey) -> Option<&BucketStats> {
        self.buckets.get(key).filter(|b| b.is_populated())
    }

    /// Populated bucket walking the direct wind-fallback chain
    /// (harsher requested buckets degrade toward normal).
    pub fn populated_with_fallback(&self, key: &ConditionKey) -> Option<(WindBucket, &BucketStats)> {
        for &bucket in key.wind.direct_fallback_chain() {
            if let Some(stats) = self.populated(&key.with_wind(bucket)) {
                return Some((bucket, stats));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConditionKey, &BucketStats)> {
        self.buckets.iter()
    }

    /// All populated base-demand entries (aux dimension `None`).
    pub fn base_entries(&self) -> impl Iterator<Item = (&ConditionKey, &BucketStats)> {
        self.buckets
            .iter()
            .filter(|(k, b)| k.aux == AuxState::None && b.is_populated())
    }

    /// Fold one raw observation into a bucket: buffer, jump-start, or EMA.
    ///
    /// This is the only mutation path for learned values; callers outside
    /// the learning manager hold `&EnergyModel` and cannot reach it.
    pub fn absorb(&mut self, key: ConditionKey, sample: f64, learning_rate: f64) -> AbsorbOutcome {
        let bucket = self.buckets.entry(key).or_default();

        if (bucket.observations as usize) < JUMP_START_SAMPLES {
            bucket.buffer.push(sample);
            bucket.observations += 1;
            if bucket.buffer.len() >= JUMP_START_SAMPLES {
                let mean = bucket.buffer.iter().sum::<f64>() / bucket.buffer.len() as f64;
                bucket.predicted = mean;
                bucket.buffer.clear();
                return AbsorbOutcome::JumpStarted { mean };
            }
            return AbsorbOutcome::Buffered { pending: bucket.buffer.len() };
        }

        let before = bucket.predicted;
        bucket.predicted += learning_rate * (sample - bucket.predicted);
        bucket.observations += 1;
        AbsorbOutcome::Updated { before, after: bucket.predicted }
    }

    /// Insert a pre-trusted bucket, used for seeding and bulk import.
    pub fn insert_seeded(&mut self, key: ConditionKey, value: f64) {
        self.buckets.insert(key, BucketStats::seeded(value));
    }

    /// Remove an entry, returning its stats. Used when reconfiguration
    /// redistributes a retired unit's coefficients.
    pub fn remove(&mut self, key: &ConditionKey) -> Option<BucketStats> {
        self.buckets.remove(key)
    }

    /// Add a delta to a bucket's predicted value without touching its
    /// observation history. Creates a seeded bucket when absent. Used when
    /// a retired unit's coefficients are redistributed.
    pub fn adjust_predicted(&mut self, key: ConditionKey, delta: f64) {
        match self.buckets.get_mut(&key) {
            Some(bucket) => bucket.predicted = (bucket.predicted + delta).max(0.0),
            None => self.insert_seeded(key, delta.max(0.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WindBucket;
    use proptest::prelude::*;

    fn key() -> ConditionKey {
        ConditionKey::base(-5, WindBucket::Normal)
    }

    #[test]
    fn first_three_samples_buffer_without_touching_prediction() {
        let mut model = EnergyModel::new();
        for (i, v) in [2.0, 3.0, 4.0].iter().enumerate() {
            let outcome = model.absorb(key(), *v, 0.01);
            assert_eq!(outcome, AbsorbOutcome::Buffered { pending: i + 1 });
        }
        let bucket = model.get(&key()).unwrap();
        assert_eq!(bucket.predicted, 0.0);
        assert!(!bucket.is_populated());
    }

    #[test]
    fn fourth_sample_jump_starts_to_buffer_mean_and_clears() {
        let mut model = EnergyModel::new();
        for v in [2.0, 3.0, 4.0] {
            model.absorb(key(), v, 0.01);
        }
        let outcome = model.absorb(key(), 7.0, 0.01);
        assert_eq!(outcome, AbsorbOutcome::JumpStarted { mean: 4.0 });

        let bucket = model.get(&key()).unwrap();
        assert!((bucket.predicted - 4.0).abs() < 1e-12);
        assert!(bucket.buffer.is_empty());
        assert!(bucket.is_populated());
    }

    #[test]
    fn steady_state_uses_ema() {
        let mut model = EnergyModel::new();
        for v in [4.0, 4.0, 4.0, 4.0] {
            model.absorb(key(), v, 0.01);
        }
        let outcome = model.absorb(key(), 14.0, 0.01);
        match outcome {
            AbsorbOutcome::Updated { before, after } => {
                assert!((before - 4.0).abs() < 1e-12);
                assert!((after - 4.1).abs() < 1e-12);
            }
            other => panic!("expected EMA update, got {other:?}"),
        }
    }

    #[test]
    fn seeded_bucket_skips_cold_start() {
        let mut model = EnergyModel::new();
        model.insert_seeded(key(), 3.0);
        assert!(model.populated(&key()).is_some());
        match model.absorb(key(), 5.0, 0.01) {
            AbsorbOutcome::Updated { .. } => {}
            other => panic!("seeded bucket must go straight to EMA, got {other:?}"),
        }
    }

    #[test]
    fn fallback_walks_toward_normal() {
        let mut model = EnergyModel::new();
        model.insert_seeded(ConditionKey::base(-5, WindBucket::Normal), 2.5);
        let (bucket, stats) = model
            .populated_with_fallback(&ConditionKey::base(-5, WindBucket::Extreme))
            .unwrap();
        assert_eq!(bucket, WindBucket::Normal);
        assert!((stats.predicted - 2.5).abs() < 1e-12);
    }

    proptest! {
        /// A single observation never moves a populated prediction by more
        /// than learning_rate × |observation − prediction|.
        #[test]
        fn ema_step_is_bounded(
            start in -50.0_f64..50.0,
            sample in -50.0_f64..50.0,
            rate in 0.001_f64..0.5,
        ) {
            let mut model = EnergyModel::new();
            model.insert_seeded(key(), start);
            let outcome = model.absorb(key(), sample, rate);
            if let AbsorbOutcome::Updated { before, after } = outcome {
                let step = (after - before).abs();
                let bound = rate * (sample - before).abs();
                prop_assert!(step <= bound + 1e-9);
            } else {
                prop_assert!(false, "expected EMA update");
            }
        }

        /// Jump-start invariant: any bucket with 4+ observations has an
        /// empty buffer.
        #[test]
        fn populated_buckets_have_empty_buffers(samples in proptest::collection::vec(-10.0_f64..10.0, 1..12)) {
            let mut model = EnergyModel::new();
            for s in &samples {
                model.absorb(key(), *s, 0.01);
            }
            let bucket = model.get(&key()).unwrap();
            if bucket.observations as usize >= JUMP_START_SAMPLES {
                prop_assert!(bucket.buffer.is_empty());
            }
        }
    }
}

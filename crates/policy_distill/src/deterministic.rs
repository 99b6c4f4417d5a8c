//! Deterministic utilities for reproducible distillation
//!
//! Every random draw in the engine (state sampling, permutation importance,
//! feature bagging) goes through an explicitly seeded RNG so that two runs
//! with the same seed build the same tree and the same rules.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

/// RNG type used by the engine when the caller does not inject one
pub type DistillRng = StdRng;

/// Build the engine's RNG from a fixed seed
pub fn seeded_rng(seed: u64) -> DistillRng {
    StdRng::seed_from_u64(seed)
}

/// Draw one standard normal variate using the Box–Muller transform
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // u1 must be strictly positive for ln()
    let u1: f64 = loop {
        let u: f64 = rng.gen();
        if u > f64::MIN_POSITIVE {
            break u;
        }
    };
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Choose `amount` distinct indices from `0..length`, returned in ascending order
pub fn sample_indices<R: Rng + ?Sized>(rng: &mut R, length: usize, amount: usize) -> Vec<usize> {
    let amount = amount.min(length);
    let mut picked = index::sample(rng, length, amount).into_vec();
    picked.sort_unstable();
    picked
}

/// Deterministic tie-breaker for split selection
///
/// Among splits with equal gain the lowest feature index wins, then the
/// lowest threshold.
#[derive(Debug, Clone, Copy)]
pub struct SplitTieBreaker {
    pub feature_idx: usize,
    pub threshold: f64,
}

impl SplitTieBreaker {
    pub fn new(feature_idx: usize, threshold: f64) -> Self {
        Self {
            feature_idx,
            threshold,
        }
    }
}

impl PartialEq for SplitTieBreaker {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SplitTieBreaker {}

impl PartialOrd for SplitTieBreaker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SplitTieBreaker {
    fn cmp(&self, other: &Self) -> Ordering {
        self.feature_idx
            .cmp(&other.feature_idx)
            .then_with(|| self.threshold.total_cmp(&other.threshold))
    }
}

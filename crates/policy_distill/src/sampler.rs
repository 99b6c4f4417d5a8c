//! Behavior sampling of an opaque policy
//!
//! Draws states from a distribution, records what the oracle does with each
//! one, and measures how much every feature matters to the oracle's choices
//! via permutation importance.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::deterministic::standard_normal;
use crate::errors::{DistillError, Result};
use crate::rule::{sanitize_unit, ActionId, FeatureIndex};

/// Ordered, fixed-length feature vector
pub type StateVector = Vec<f64>;

/// The policy being distilled
pub trait PolicyOracle {
    /// Return the chosen action and, when available, the action distribution
    fn act(&self, state: &[f64]) -> anyhow::Result<(ActionId, Vec<f64>)>;
}

impl<F> PolicyOracle for F
where
    F: Fn(&[f64]) -> anyhow::Result<(ActionId, Vec<f64>)>,
{
    fn act(&self, state: &[f64]) -> anyhow::Result<(ActionId, Vec<f64>)> {
        self(state)
    }
}

/// Adapter for policies that only expose a forward scoring function
///
/// The action is the argmax of the output vector (lowest index on ties).
pub struct ScoringOracle<F> {
    forward: F,
}

impl<F> ScoringOracle<F>
where
    F: Fn(&[f64]) -> anyhow::Result<Vec<f64>>,
{
    pub fn new(forward: F) -> Self {
        Self { forward }
    }
}

impl<F> PolicyOracle for ScoringOracle<F>
where
    F: Fn(&[f64]) -> anyhow::Result<Vec<f64>>,
{
    fn act(&self, state: &[f64]) -> anyhow::Result<(ActionId, Vec<f64>)> {
        let scores = (self.forward)(state)?;
        let action = argmax(&scores)
            .ok_or_else(|| anyhow::anyhow!("forward pass returned an empty output vector"))?;
        Ok((action, scores))
    }
}

/// Index of the largest finite value, lowest index on ties
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Caller-supplied per-feature generator
pub type FeatureGenerator = Arc<dyn Fn(FeatureIndex, &mut dyn RngCore) -> f64 + Send + Sync>;

/// Where sampled states come from
#[derive(Clone)]
pub enum StateDistribution {
    /// Every feature uniform in `[min, max)`
    Uniform { min: f64, max: f64, dim: usize },
    /// Every feature normal with the given mean and standard deviation
    Normal { mean: f64, std: f64, dim: usize },
    /// Feature `i` uniform in `bounds[i]`
    UniformBox { bounds: Vec<(f64, f64)> },
    /// Caller-owned generator keyed by feature index
    Custom { dim: usize, generator: FeatureGenerator },
}

impl fmt::Debug for StateDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform { min, max, dim } => f
                .debug_struct("Uniform")
                .field("min", min)
                .field("max", max)
                .field("dim", dim)
                .finish(),
            Self::Normal { mean, std, dim } => f
                .debug_struct("Normal")
                .field("mean", mean)
                .field("std", std)
                .field("dim", dim)
                .finish(),
            Self::UniformBox { bounds } => {
                f.debug_struct("UniformBox").field("bounds", bounds).finish()
            }
            Self::Custom { dim, .. } => f.debug_struct("Custom").field("dim", dim).finish(),
        }
    }
}

impl StateDistribution {
    /// Custom distribution from a closure
    pub fn custom<F>(dim: usize, generator: F) -> Self
    where
        F: Fn(FeatureIndex, &mut dyn RngCore) -> f64 + Send + Sync + 'static,
    {
        Self::Custom {
            dim,
            generator: Arc::new(generator),
        }
    }

    pub fn dimensionality(&self) -> usize {
        match self {
            Self::Uniform { dim, .. } | Self::Normal { dim, .. } | Self::Custom { dim, .. } => *dim,
            Self::UniformBox { bounds } => bounds.len(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensionality() == 0 {
            return Err(DistillError::InvalidConfig(
                "state distribution must have at least one feature".to_string(),
            ));
        }
        let check_range = |lo: f64, hi: f64| {
            // The width must be finite too, or sampling overflows
            if !lo.is_finite() || !hi.is_finite() || lo >= hi || !(hi - lo).is_finite() {
                Err(DistillError::InvalidConfig(format!(
                    "uniform range [{lo}, {hi}) is empty or not finite"
                )))
            } else {
                Ok(())
            }
        };
        match self {
            Self::Uniform { min, max, .. } => check_range(*min, *max),
            Self::UniformBox { bounds } => bounds.iter().try_for_each(|&(lo, hi)| check_range(lo, hi)),
            Self::Normal { mean, std, .. } => {
                if !mean.is_finite() || !std.is_finite() || *std < 0.0 {
                    Err(DistillError::InvalidConfig(format!(
                        "normal distribution needs finite mean and non-negative std, got ({mean}, {std})"
                    )))
                } else {
                    Ok(())
                }
            }
            Self::Custom { .. } => Ok(()),
        }
    }

    /// Draw one state vector
    pub fn sample<R: RngCore>(&self, rng: &mut R) -> StateVector {
        match self {
            Self::Uniform { min, max, dim } => {
                (0..*dim).map(|_| rng.gen_range(*min..*max)).collect()
            }
            Self::Normal { mean, std, dim } => (0..*dim)
                .map(|_| mean + std * standard_normal(rng))
                .collect(),
            Self::UniformBox { bounds } => bounds
                .iter()
                .map(|&(lo, hi)| rng.gen_range(lo..hi))
                .collect(),
            Self::Custom { dim, generator } => {
                (0..*dim).map(|feature| generator(feature, &mut *rng)).collect()
            }
        }
    }
}

/// One observed (state, action) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub state: StateVector,
    pub action: ActionId,
    #[serde(default)]
    pub action_distribution: Vec<f64>,
    pub confidence: f64,
}

impl Sample {
    /// Build a sample; confidence is the distribution's peak, or the default
    pub fn new(
        state: StateVector,
        action: ActionId,
        action_distribution: Vec<f64>,
        default_confidence: f64,
    ) -> Self {
        let confidence = action_distribution
            .iter()
            .copied()
            .filter(|p| !p.is_nan())
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
            .map(sanitize_unit)
            .unwrap_or(default_confidence);
        Self {
            state,
            action,
            action_distribution,
            confidence,
        }
    }
}

/// Importance of a single feature to the oracle's behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: FeatureIndex,
    /// `max(0, baseline consistency - permuted consistency)`
    pub importance: f64,
    /// Fraction of samples whose action changed once the feature was shuffled
    pub disagreement_rate: f64,
}

/// Output of [`BehaviorSampler::analyze`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorAnalysis {
    pub samples: Vec<Sample>,
    pub action_histogram: BTreeMap<ActionId, usize>,
    /// Sorted by importance, highest first
    pub feature_importance: Vec<FeatureImportance>,
    pub baseline_consistency: f64,
}

/// Sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Confidence assigned when the oracle gives no distribution
    pub default_confidence: f64,
    /// Compute permutation importance (costs `n * dim` extra oracle calls)
    pub compute_importance: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_confidence: 0.5,
            compute_importance: true,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_confidence) {
            return Err(DistillError::InvalidConfig(format!(
                "default_confidence {} outside [0, 1]",
                self.default_confidence
            )));
        }
        Ok(())
    }
}

/// Samples an oracle's behavior over a state distribution
#[derive(Debug, Clone, Default)]
pub struct BehaviorSampler {
    config: SamplerConfig,
}

impl BehaviorSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    /// Sample `n` states, query the oracle on each, and rank features
    ///
    /// Any oracle failure aborts the whole analysis.
    #[instrument(skip(self, oracle, distribution, rng), fields(n = n))]
    pub fn analyze<O, R>(
        &self,
        oracle: &O,
        distribution: &StateDistribution,
        n: usize,
        rng: &mut R,
    ) -> Result<BehaviorAnalysis>
    where
        O: PolicyOracle + ?Sized,
        R: RngCore,
    {
        distribution.validate()?;
        let dim = distribution.dimensionality();

        let mut samples = Vec::with_capacity(n);
        let mut action_histogram = BTreeMap::new();

        for idx in 0..n {
            let state = distribution.sample(rng);
            let (action, action_distribution) = query(oracle, &state, idx)?;
            *action_histogram.entry(action).or_insert(0) += 1;
            samples.push(Sample::new(
                state,
                action,
                action_distribution,
                self.config.default_confidence,
            ));
        }

        let actions: Vec<ActionId> = samples.iter().map(|s| s.action).collect();
        let baseline_consistency = consistency_score(&actions);

        let feature_importance = if self.config.compute_importance && !samples.is_empty() {
            permutation_importance(oracle, &samples, dim, baseline_consistency, rng)?
        } else {
            Vec::new()
        };

        info!(
            samples = samples.len(),
            distinct_actions = action_histogram.len(),
            baseline_consistency,
            "behavior analysis complete"
        );

        Ok(BehaviorAnalysis {
            samples,
            action_histogram,
            feature_importance,
            baseline_consistency,
        })
    }
}

fn query<O: PolicyOracle + ?Sized>(
    oracle: &O,
    state: &[f64],
    idx: usize,
) -> Result<(ActionId, Vec<f64>)> {
    oracle
        .act(state)
        .map_err(|err| DistillError::Oracle(format!("sample {idx}: {err:#}")))
}

/// Shannon entropy (bits) of an action multiset
pub fn action_entropy(actions: &[ActionId]) -> f64 {
    if actions.is_empty() {
        return 0.0;
    }
    let mut counts: BTreeMap<ActionId, usize> = BTreeMap::new();
    for &a in actions {
        *counts.entry(a).or_insert(0) += 1;
    }
    let total = actions.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// `1 - H(actions) / log2(#distinct actions)`; 1.0 when at most one action occurs
pub fn consistency_score(actions: &[ActionId]) -> f64 {
    let mut distinct: Vec<ActionId> = actions.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() <= 1 {
        return 1.0;
    }
    let h_max = (distinct.len() as f64).log2();
    (1.0 - action_entropy(actions) / h_max).clamp(0.0, 1.0)
}

/// Shuffle one feature column at a time, re-query the oracle, and compare
fn permutation_importance<O, R>(
    oracle: &O,
    samples: &[Sample],
    dim: usize,
    baseline: f64,
    rng: &mut R,
) -> Result<Vec<FeatureImportance>>
where
    O: PolicyOracle + ?Sized,
    R: RngCore,
{
    // Working copy; exactly one column differs from the originals at any time
    let mut states: Vec<StateVector> = samples.iter().map(|s| s.state.clone()).collect();
    let mut ranking = Vec::with_capacity(dim);

    for feature in 0..dim {
        let original: Vec<f64> = states.iter().map(|s| s[feature]).collect();
        let mut shuffled = original.clone();
        shuffled.shuffle(rng);
        for (state, value) in states.iter_mut().zip(&shuffled) {
            state[feature] = *value;
        }

        let mut permuted_actions = Vec::with_capacity(states.len());
        let mut changed = 0usize;
        for (idx, (state, sample)) in states.iter().zip(samples).enumerate() {
            let (action, _) = query(oracle, state, idx)?;
            if action != sample.action {
                changed += 1;
            }
            permuted_actions.push(action);
        }

        for (state, value) in states.iter_mut().zip(&original) {
            state[feature] = *value;
        }

        let permuted = consistency_score(&permuted_actions);
        let entry = FeatureImportance {
            feature,
            importance: (baseline - permuted).max(0.0),
            disagreement_rate: changed as f64 / samples.len() as f64,
        };
        debug!(
            feature,
            importance = entry.importance,
            disagreement = entry.disagreement_rate,
            "permutation importance"
        );
        ranking.push(entry);
    }

    ranking.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| b.disagreement_rate.total_cmp(&a.disagreement_rate))
            .then_with(|| a.feature.cmp(&b.feature))
    });
    Ok(ranking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deterministic::seeded_rng;
    use std::cell::Cell;

    fn threshold_oracle(state: &[f64]) -> anyhow::Result<(ActionId, Vec<f64>)> {
        if state[0] > 0.5 {
            Ok((1, vec![0.1, 0.9]))
        } else {
            Ok((0, vec![0.8, 0.2]))
        }
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), Some(1));
        assert_eq!(argmax(&[f64::NAN, -1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn sample_confidence_uses_distribution_peak() {
        let s = Sample::new(vec![0.0], 1, vec![0.2, 0.7, 0.1], 0.5);
        assert!((s.confidence - 0.7).abs() < 1e-12);
        let s = Sample::new(vec![0.0], 1, Vec::new(), 0.5);
        assert!((s.confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn consistency_score_bounds() {
        assert_eq!(consistency_score(&[]), 1.0);
        assert_eq!(consistency_score(&[3, 3, 3]), 1.0);
        assert!(consistency_score(&[0, 1, 0, 1]).abs() < 1e-12);
        let skewed = consistency_score(&[0, 0, 0, 1]);
        assert!(skewed > 0.0 && skewed < 1.0);
    }

    #[test]
    fn analyze_builds_histogram_and_ranks_features() {
        let sampler = BehaviorSampler::default();
        let distribution = StateDistribution::Uniform {
            min: 0.0,
            max: 1.0,
            dim: 3,
        };
        let mut rng = seeded_rng(11);
        let analysis = sampler
            .analyze(&threshold_oracle, &distribution, 400, &mut rng)
            .unwrap();

        assert_eq!(analysis.samples.len(), 400);
        assert_eq!(analysis.action_histogram.values().sum::<usize>(), 400);
        assert_eq!(analysis.feature_importance.len(), 3);
        // Only feature 0 drives the oracle, so only it changes actions when shuffled
        let top = analysis.feature_importance[0];
        assert_eq!(top.feature, 0);
        assert!(top.disagreement_rate > 0.3);
        for other in &analysis.feature_importance[1..] {
            assert_eq!(other.disagreement_rate, 0.0);
            assert_eq!(other.importance, 0.0);
        }
        // States are restored after each permutation
        for sample in &analysis.samples {
            assert_eq!(threshold_oracle(&sample.state).unwrap().0, sample.action);
        }
    }

    #[test]
    fn oracle_failure_aborts_analysis() {
        let calls = Cell::new(0usize);
        let flaky = |_: &[f64]| -> anyhow::Result<(ActionId, Vec<f64>)> {
            calls.set(calls.get() + 1);
            if calls.get() == 5 {
                anyhow::bail!("policy backend unavailable");
            }
            Ok((0, Vec::new()))
        };
        let distribution = StateDistribution::Uniform {
            min: 0.0,
            max: 1.0,
            dim: 1,
        };
        let err = BehaviorSampler::default()
            .analyze(&flaky, &distribution, 10, &mut seeded_rng(1))
            .unwrap_err();

        assert!(matches!(err, DistillError::Oracle(msg) if msg.contains("unavailable")));
    }

    #[test]
    fn scoring_oracle_takes_argmax() {
        let oracle = ScoringOracle::new(|state: &[f64]| Ok(vec![state[0], 1.0 - state[0]]));
        assert_eq!(oracle.act(&[0.9]).unwrap().0, 0);
        assert_eq!(oracle.act(&[0.1]).unwrap().0, 1);

        let empty = ScoringOracle::new(|_: &[f64]| Ok(Vec::new()));
        assert!(empty.act(&[0.0]).is_err());
    }

    #[test]
    fn distributions_respect_shape() {
        let mut rng = seeded_rng(5);
        let boxed = StateDistribution::UniformBox {
            bounds: vec![(0.0, 1.0), (10.0, 20.0)],
        };
        for _ in 0..100 {
            let s = boxed.sample(&mut rng);
            assert!((0.0..1.0).contains(&s[0]));
            assert!((10.0..20.0).contains(&s[1]));
        }

        let custom = StateDistribution::custom(3, |feature, _rng| feature as f64);
        assert_eq!(custom.sample(&mut rng), vec![0.0, 1.0, 2.0]);

        let normal = StateDistribution::Normal {
            mean: 5.0,
            std: 0.0,
            dim: 2,
        };
        assert_eq!(normal.sample(&mut rng), vec![5.0, 5.0]);
    }

    #[test]
    fn invalid_distributions_are_rejected() {
        let empty = StateDistribution::Uniform {
            min: 1.0,
            max: 1.0,
            dim: 2,
        };
        assert!(matches!(empty.validate(), Err(DistillError::InvalidConfig(_))));
        let no_dims = StateDistribution::UniformBox { bounds: Vec::new() };
        assert!(no_dims.validate().is_err());
        let negative_std = StateDistribution::Normal {
            mean: 0.0,
            std: -1.0,
            dim: 1,
        };
        assert!(negative_std.validate().is_err());

        let overflowing = StateDistribution::Uniform {
            min: -f64::MAX,
            max: f64::MAX,
            dim: 1,
        };
        assert!(matches!(overflowing.validate(), Err(DistillError::InvalidConfig(_))));
        let overflowing_box = StateDistribution::UniformBox {
            bounds: vec![(0.0, 1.0), (-f64::MAX, f64::MAX)],
        };
        assert!(overflowing_box.validate().is_err());
    }
}

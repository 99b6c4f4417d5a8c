//! CART (Classification and Regression Tree) builder
//!
//! Grows a classification tree over sampled (state, action) pairs with
//! impurity-minimizing threshold splits and per-node feature bagging.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::deterministic::{sample_indices, SplitTieBreaker};
use crate::errors::{DistillError, Result};
use crate::rule::ActionId;
use crate::sampler::Sample;
use crate::tree::{DecisionTree, TreeNode};

/// Gains at or below this are treated as no improvement
const MIN_GAIN: f64 = 1e-12;

/// Node impurity measure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpurityCriterion {
    #[default]
    Gini,
    Entropy,
}

impl ImpurityCriterion {
    /// Impurity of a class-count vector
    pub fn impurity(&self, counts: &[usize]) -> f64 {
        let total: usize = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let total = total as f64;
        match self {
            Self::Gini => {
                1.0 - counts
                    .iter()
                    .map(|&c| {
                        let p = c as f64 / total;
                        p * p
                    })
                    .sum::<f64>()
            }
            Self::Entropy => counts
                .iter()
                .filter(|&&c| c > 0)
                .map(|&c| {
                    let p = c as f64 / total;
                    -p * p.log2()
                })
                .sum(),
        }
    }
}

/// Training parameters for a single tree
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Share of features considered at each node
    pub feature_fraction: f64,
    pub criterion: ImpurityCriterion,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            min_samples_split: 10,
            min_samples_leaf: 5,
            feature_fraction: 0.8,
            criterion: ImpurityCriterion::Gini,
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(DistillError::InvalidConfig(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(DistillError::InvalidConfig(
                "min_samples_leaf must be at least 1".to_string(),
            ));
        }
        if self.min_samples_leaf > self.min_samples_split {
            return Err(DistillError::InvalidConfig(format!(
                "min_samples_leaf ({}) exceeds min_samples_split ({})",
                self.min_samples_leaf, self.min_samples_split
            )));
        }
        if !(self.feature_fraction > 0.0 && self.feature_fraction <= 1.0) {
            return Err(DistillError::InvalidConfig(format!(
                "feature_fraction {} outside (0, 1]",
                self.feature_fraction
            )));
        }
        Ok(())
    }

    /// Features drawn per node: `floor(fraction * dim)`, at least one
    pub fn features_per_split(&self, feature_count: usize) -> usize {
        ((self.feature_fraction * feature_count as f64).floor() as usize).clamp(1, feature_count.max(1))
    }
}

/// Split candidate with gain and tie-breaker
#[derive(Debug, Clone)]
struct SplitCandidate {
    feature_idx: usize,
    threshold: f64,
    gain: f64,
    tie_breaker: SplitTieBreaker,
}

impl SplitCandidate {
    fn new(feature_idx: usize, threshold: f64, gain: f64) -> Self {
        Self {
            feature_idx,
            threshold,
            gain,
            tie_breaker: SplitTieBreaker::new(feature_idx, threshold),
        }
    }

    fn beats(&self, current: &SplitCandidate) -> bool {
        self.gain > current.gain
            || (self.gain == current.gain && self.tie_breaker < current.tie_breaker)
    }
}

/// Grows a [`DecisionTree`] from sampled behavior
#[derive(Debug, Clone, Default)]
pub struct TreeBuilder {
    config: TreeConfig,
}

impl TreeBuilder {
    pub fn new(config: TreeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Build a tree; `rng` drives feature bagging only
    pub fn build<R: RngCore>(&self, samples: &[Sample], rng: &mut R) -> Result<DecisionTree> {
        self.config.validate()?;
        let first = samples.first().ok_or(DistillError::EmptyTrainingSet)?;
        let feature_count = first.state.len();

        for sample in samples {
            if sample.state.len() != feature_count {
                return Err(DistillError::DimensionMismatch {
                    expected: feature_count,
                    actual: sample.state.len(),
                });
            }
            if sample.state.iter().any(|v| !v.is_finite()) {
                return Err(DistillError::InvalidConfig(
                    "training states must contain only finite values".to_string(),
                ));
            }
        }

        // Dense class labels keep per-node counting in flat vectors
        let mut classes: Vec<ActionId> = samples.iter().map(|s| s.action).collect();
        classes.sort_unstable();
        classes.dedup();
        let labels: Vec<usize> = samples
            .iter()
            .map(|s| classes.binary_search(&s.action).unwrap_or(0))
            .collect();

        let growth = Growth {
            config: &self.config,
            samples,
            labels: &labels,
            classes: &classes,
            feature_count,
        };
        let indices: Vec<usize> = (0..samples.len()).collect();
        let root = growth.build_node(&indices, 0, rng);
        let tree = DecisionTree::new(root, feature_count, samples.len());

        info!(
            samples = samples.len(),
            features = feature_count,
            depth = tree.depth(),
            leaves = tree.leaf_count(),
            "decision tree built"
        );
        Ok(tree)
    }
}

/// Borrowed state for one build
struct Growth<'a> {
    config: &'a TreeConfig,
    samples: &'a [Sample],
    labels: &'a [usize],
    classes: &'a [ActionId],
    feature_count: usize,
}

impl Growth<'_> {
    fn class_counts(&self, indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for &idx in indices {
            counts[self.labels[idx]] += 1;
        }
        counts
    }

    /// Recursively build tree nodes
    fn build_node<R: RngCore>(&self, indices: &[usize], depth: usize, rng: &mut R) -> TreeNode {
        let counts = self.class_counts(indices);
        let impurity = self.config.criterion.impurity(&counts);
        let distinct = counts.iter().filter(|&&c| c > 0).count();

        if depth >= self.config.max_depth
            || indices.len() < self.config.min_samples_split
            || distinct <= 1
        {
            return self.leaf(&counts, indices.len(), impurity);
        }

        let split = match self.find_best_split(indices, impurity, rng) {
            Some(s) => s,
            None => return self.leaf(&counts, indices.len(), impurity),
        };

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&idx| self.samples[idx].state[split.feature_idx] <= split.threshold);

        debug!(
            depth,
            feature = split.feature_idx,
            threshold = split.threshold,
            gain = split.gain,
            left = left_indices.len(),
            right = right_indices.len(),
            "split"
        );

        TreeNode::Split {
            feature: split.feature_idx,
            threshold: split.threshold,
            left: Box::new(self.build_node(&left_indices, depth + 1, rng)),
            right: Box::new(self.build_node(&right_indices, depth + 1, rng)),
        }
    }

    /// Majority-vote leaf; ties go to the lowest action id
    fn leaf(&self, counts: &[usize], total: usize, impurity: f64) -> TreeNode {
        let (class, count) = counts
            .iter()
            .enumerate()
            .fold((0usize, 0usize), |best, (class, &count)| {
                if count > best.1 {
                    (class, count)
                } else {
                    best
                }
            });
        let confidence = if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        };
        TreeNode::Leaf {
            action: self.classes.get(class).copied().unwrap_or_default(),
            confidence,
            samples: total,
            impurity,
        }
    }

    /// Best positive-gain split over a fresh random subset of features
    fn find_best_split<R: RngCore>(
        &self,
        indices: &[usize],
        parent_impurity: f64,
        rng: &mut R,
    ) -> Option<SplitCandidate> {
        let n_features = self.config.features_per_split(self.feature_count);
        let candidates = sample_indices(rng, self.feature_count, n_features);
        let total = indices.len() as f64;
        let parent_counts = self.class_counts(indices);
        let mut best_split: Option<SplitCandidate> = None;

        for feature_idx in candidates {
            let mut column: Vec<(f64, usize)> = indices
                .iter()
                .map(|&idx| (self.samples[idx].state[feature_idx], self.labels[idx]))
                .collect();
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_counts = vec![0usize; self.classes.len()];
            let mut right_counts = parent_counts.clone();

            for i in 0..column.len().saturating_sub(1) {
                let (value, label) = column[i];
                left_counts[label] += 1;
                right_counts[label] -= 1;

                let next_value = column[i + 1].0;
                if value == next_value {
                    continue;
                }

                let n_left = i + 1;
                let n_right = column.len() - n_left;
                if n_left < self.config.min_samples_leaf || n_right < self.config.min_samples_leaf {
                    continue;
                }

                let threshold = value + (next_value - value) / 2.0;
                // Adjacent floats can collapse the midpoint onto the upper value
                if !(threshold >= value && threshold < next_value) {
                    continue;
                }

                let gain = parent_impurity
                    - (n_left as f64 / total) * self.config.criterion.impurity(&left_counts)
                    - (n_right as f64 / total) * self.config.criterion.impurity(&right_counts);
                if gain <= MIN_GAIN {
                    continue;
                }

                let candidate = SplitCandidate::new(feature_idx, threshold, gain);
                best_split = match best_split {
                    Some(current) if !candidate.beats(&current) => Some(current),
                    _ => Some(candidate),
                };
            }
        }

        best_split
    }
}

//! Rule extraction and rule-set optimization
//!
//! Flattens a decision tree into one rule per leaf, then filters by quality,
//! removes duplicate signatures, merges similar same-action rules, and caps
//! the rule budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::errors::{DistillError, Result};
use crate::rule::{FeatureConstraint, PolicyRule, QualityWeights, RuleCondition, RuleMetadata};
use crate::tree::{DecisionTree, TreeNode};

/// Rule-set optimization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Extracted rules scoring below this are dropped
    pub quality_threshold: f64,
    /// Rule budget after optimization
    pub max_rules: usize,
    /// Minimum feature-set overlap for two same-action rules to merge
    pub merge_overlap_threshold: f64,
    /// Offset added to the threshold on the right-hand side of a split
    pub boundary_epsilon: f64,
    /// Active-feature count that maps to complexity 1.0
    pub complexity_norm: f64,
    /// Support that maps to specificity 0.0
    pub specificity_norm: f64,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.5,
            max_rules: 500,
            merge_overlap_threshold: 0.7,
            boundary_epsilon: 1e-3,
            complexity_norm: 10.0,
            specificity_norm: 1000.0,
        }
    }
}

impl OptimizeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(DistillError::InvalidConfig(format!(
                "optimize.quality_threshold {} outside [0, 1]",
                self.quality_threshold
            )));
        }
        if self.max_rules == 0 {
            return Err(DistillError::InvalidConfig(
                "max_rules must be positive".to_string(),
            ));
        }
        if !(self.merge_overlap_threshold > 0.0 && self.merge_overlap_threshold <= 1.0) {
            return Err(DistillError::InvalidConfig(format!(
                "merge_overlap_threshold {} outside (0, 1]",
                self.merge_overlap_threshold
            )));
        }
        if !(self.boundary_epsilon > 0.0 && self.boundary_epsilon.is_finite()) {
            return Err(DistillError::InvalidConfig(
                "boundary_epsilon must be positive".to_string(),
            ));
        }
        if self.complexity_norm <= 0.0 || self.specificity_norm <= 0.0 {
            return Err(DistillError::InvalidConfig(
                "metadata normalizers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Turns trees into compact, ranked rule sets
#[derive(Debug, Clone, Default)]
pub struct RuleOptimizer {
    config: OptimizeConfig,
    weights: QualityWeights,
}

impl RuleOptimizer {
    pub fn new(config: OptimizeConfig, weights: QualityWeights) -> Self {
        Self { config, weights }
    }

    pub fn config(&self) -> &OptimizeConfig {
        &self.config
    }

    /// Extract and optimize in one pass
    pub fn extract_and_optimize(&self, tree: &DecisionTree, now: DateTime<Utc>) -> Vec<PolicyRule> {
        let extracted = self.extract_rules(tree, now);
        self.optimize(extracted, now)
    }

    /// One rule per reachable leaf
    ///
    /// Going left tightens `max = threshold`; going right tightens
    /// `min = threshold + epsilon`. Leaves whose accumulated bounds are
    /// contradictory can never match a state and are skipped.
    pub fn extract_rules(&self, tree: &DecisionTree, now: DateTime<Utc>) -> Vec<PolicyRule> {
        let mut rules = Vec::new();
        self.extract_node(&tree.root, RuleCondition::new(), tree.total_samples, now, &mut rules);
        debug!(rules = rules.len(), "rules extracted from tree");
        rules
    }

    fn extract_node(
        &self,
        node: &TreeNode,
        condition: RuleCondition,
        total_samples: usize,
        now: DateTime<Utc>,
        out: &mut Vec<PolicyRule>,
    ) {
        match node {
            TreeNode::Leaf {
                action,
                confidence,
                samples,
                ..
            } => {
                let support = *samples as u64;
                let metadata = self.metadata_for(&condition, support, total_samples);
                out.push(
                    PolicyRule::new(condition, *action, *confidence, support, now)
                        .with_metadata(metadata),
                );
            }
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let mut left_condition = condition.clone();
                match left_condition.constrain(*feature, FeatureConstraint::at_most(*threshold)) {
                    Ok(()) => self.extract_node(left, left_condition, total_samples, now, out),
                    Err(err) => debug!(feature, %err, "skipping unreachable left branch"),
                }

                let mut right_condition = condition;
                let lower = *threshold + self.config.boundary_epsilon;
                match right_condition.constrain(*feature, FeatureConstraint::at_least(lower)) {
                    Ok(()) => self.extract_node(right, right_condition, total_samples, now, out),
                    Err(err) => debug!(feature, %err, "skipping unreachable right branch"),
                }
            }
        }
    }

    fn metadata_for(&self, condition: &RuleCondition, support: u64, total_samples: usize) -> RuleMetadata {
        RuleMetadata {
            complexity_score: (condition.len() as f64 / self.config.complexity_norm).min(1.0),
            generalization_score: if total_samples == 0 {
                0.0
            } else {
                (support as f64 / total_samples as f64).min(1.0)
            },
            specificity: (1.0 - support as f64 / self.config.specificity_norm).max(0.0),
        }
    }

    /// Quality filter, deduplication, merging, and truncation
    pub fn optimize(&self, rules: Vec<PolicyRule>, now: DateTime<Utc>) -> Vec<PolicyRule> {
        let extracted = rules.len();

        let filtered: Vec<PolicyRule> = rules
            .into_iter()
            .filter(|rule| rule.quality_score(&self.weights, now) >= self.config.quality_threshold)
            .collect();
        let after_filter = filtered.len();

        let unique = deduplicate(filtered);
        let after_dedup = unique.len();

        let merged = deduplicate(self.merge_similar(unique, now));
        let after_merge = merged.len();

        let ranked = self.truncate(merged, now);

        info!(
            extracted,
            after_filter,
            after_dedup,
            after_merge,
            kept = ranked.len(),
            "rule set optimized"
        );
        ranked
    }

    /// Merge same-action rules whose feature sets overlap enough
    ///
    /// Each unmerged rule seeds a group of later, still-unmerged rules; a
    /// rule joins at most one group per pass.
    pub fn merge_similar(&self, rules: Vec<PolicyRule>, now: DateTime<Utc>) -> Vec<PolicyRule> {
        let mut consumed = vec![false; rules.len()];
        let mut output = Vec::with_capacity(rules.len());

        for i in 0..rules.len() {
            if consumed[i] {
                continue;
            }
            // Grow the group one compatible rule at a time; a rule whose bounds
            // contradict the accumulated condition stays free for later seeds
            let mut condition = rules[i].condition.clone();
            let mut group = vec![i];
            for j in i + 1..rules.len() {
                if consumed[j]
                    || rules[j].action != rules[i].action
                    || rules[i].condition.overlap_ratio(&rules[j].condition)
                        < self.config.merge_overlap_threshold
                {
                    continue;
                }
                match condition.intersect(&rules[j].condition) {
                    Ok(narrowed) => {
                        condition = narrowed;
                        group.push(j);
                    }
                    Err(err) => debug!(%err, "rules overlap but have disjoint bounds, kept apart"),
                }
            }

            if group.len() == 1 {
                continue;
            }

            let merged = self.merged_rule(&rules, &group, condition, now);
            debug!(members = group.len(), action = merged.action, "merged rules");
            for &idx in &group {
                consumed[idx] = true;
            }
            output.push(merged);
        }

        output.extend(
            rules
                .into_iter()
                .zip(consumed)
                .filter(|(_, used)| !used)
                .map(|(rule, _)| rule),
        );
        output
    }

    fn merged_rule(
        &self,
        rules: &[PolicyRule],
        group: &[usize],
        condition: RuleCondition,
        now: DateTime<Utc>,
    ) -> PolicyRule {
        let first = &rules[group[0]];
        let n = group.len() as f64;
        let confidence = group.iter().map(|&i| rules[i].confidence).sum::<f64>() / n;
        let performance = group.iter().map(|&i| rules[i].performance).sum::<f64>() / n;
        let support = group.iter().map(|&i| rules[i].support).sum::<u64>();
        let generalization = group
            .iter()
            .map(|&i| rules[i].metadata.generalization_score)
            .sum::<f64>()
            .min(1.0);

        let mut metadata = self.metadata_for(&condition, support, 0);
        metadata.generalization_score = generalization;

        PolicyRule::new(condition, first.action, confidence, support, now)
            .with_performance(performance)
            .with_metadata(metadata)
    }

    /// Highest quality first, ties by support; keep at most `max_rules`
    pub fn truncate(&self, mut rules: Vec<PolicyRule>, now: DateTime<Utc>) -> Vec<PolicyRule> {
        rules.sort_by(|a, b| {
            b.quality_score(&self.weights, now)
                .total_cmp(&a.quality_score(&self.weights, now))
                .then_with(|| b.support.cmp(&a.support))
        });
        rules.truncate(self.config.max_rules);
        rules
    }
}

/// Keep the first rule of every `(condition, action)` signature
pub fn deduplicate(rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .filter(|rule| seen.insert(rule.signature()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(pairs: &[(usize, FeatureConstraint)]) -> RuleCondition {
        RuleCondition::from_constraints(pairs.iter().copied()).unwrap()
    }

    fn rule(condition: RuleCondition, action: usize, support: u64) -> PolicyRule {
        PolicyRule::new(condition, action, 0.9, support, Utc::now())
    }

    fn optimizer() -> RuleOptimizer {
        RuleOptimizer::default()
    }

    fn leaf(action: usize, samples: usize) -> Box<TreeNode> {
        Box::new(TreeNode::Leaf {
            action,
            confidence: 1.0,
            samples,
            impurity: 0.0,
        })
    }

    #[test]
    fn extraction_tightens_bounds_along_paths() {
        let tree = DecisionTree::new(
            TreeNode::Split {
                feature: 0,
                threshold: 0.5,
                left: leaf(0, 50),
                right: Box::new(TreeNode::Split {
                    feature: 0,
                    threshold: 0.8,
                    left: leaf(1, 30),
                    right: leaf(2, 20),
                }),
            },
            1,
            100,
        );
        let rules = optimizer().extract_rules(&tree, Utc::now());

        assert_eq!(rules.len(), 3);
        let middle = &rules[1].condition;
        let c = middle.get(0).unwrap();
        assert!((c.min.unwrap() - 0.501).abs() < 1e-12);
        assert_eq!(c.max, Some(0.8));
        assert_eq!(rules[1].support, 30);
        assert!((rules[1].metadata.generalization_score - 0.3).abs() < 1e-12);
        assert!((rules[1].metadata.complexity_score - 0.1).abs() < 1e-12);
        assert!((rules[1].metadata.specificity - 0.97).abs() < 1e-12);

        // Sibling leaves never both match
        for x in [0.0, 0.5, 0.5005, 0.501, 0.8, 0.8005, 0.81, 2.0] {
            let matched = rules.iter().filter(|r| r.applies_to(&[x])).count();
            assert!(matched <= 1, "state {x} matched {matched} rules");
        }
    }

    #[test]
    fn extract_and_optimize_drops_thin_leaves() {
        let opt = RuleOptimizer::new(
            OptimizeConfig {
                quality_threshold: 0.7,
                ..OptimizeConfig::default()
            },
            QualityWeights::default(),
        );
        let tree = DecisionTree::new(
            TreeNode::Split {
                feature: 0,
                threshold: 0.5,
                left: leaf(0, 200),
                right: leaf(1, 1),
            },
            1,
            201,
        );
        let rules = opt.extract_and_optimize(&tree, Utc::now());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, 0);
    }

    #[test]
    fn unreachable_leaves_are_skipped() {
        // Right of 0.5 then left of 0.5004: min 0.501 > max 0.5004
        let tree = DecisionTree::new(
            TreeNode::Split {
                feature: 0,
                threshold: 0.5,
                left: leaf(0, 10),
                right: Box::new(TreeNode::Split {
                    feature: 0,
                    threshold: 0.5004,
                    left: leaf(1, 10),
                    right: leaf(2, 10),
                }),
            },
            1,
            30,
        );
        let rules = optimizer().extract_rules(&tree, Utc::now());
        let actions: Vec<usize> = rules.iter().map(|r| r.action).collect();

        assert_eq!(actions, vec![0, 2]);
    }

    #[test]
    fn quality_filter_drops_weak_rules() {
        let now = Utc::now();
        let weak = PolicyRule::new(cond(&[(0, FeatureConstraint::at_most(1.0))]), 0, 0.0, 0, now)
            .with_performance(-1.0);
        let strong = rule(cond(&[(0, FeatureConstraint::at_least(2.0))]), 1, 50);
        let kept = optimizer().optimize(vec![weak, strong], now);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].action, 1);
    }

    #[test]
    fn deduplicate_keeps_first_signature() {
        let c = cond(&[(0, FeatureConstraint::at_most(1.0))]);
        let a = rule(c.clone(), 0, 10);
        let first_id = a.id;
        let rules = deduplicate(vec![a, rule(c.clone(), 0, 99), rule(c, 1, 10)]);

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, first_id);
    }

    #[test]
    fn merge_requires_overlap_threshold() {
        let now = Utc::now();
        let opt = optimizer();

        let a = rule(cond(&[(0, FeatureConstraint::at_most(1.0))]), 0, 50);
        let b = rule(
            cond(&[
                (0, FeatureConstraint::at_most(1.0)),
                (1, FeatureConstraint::at_least(0.0)),
            ]),
            0,
            50,
        );
        assert_eq!(opt.merge_similar(vec![a, b.clone()], now).len(), 2);

        let c = rule(
            cond(&[
                (0, FeatureConstraint::at_most(1.0)),
                (1, FeatureConstraint::at_least(0.0)),
                (2, FeatureConstraint::exactly(5.0)),
            ]),
            0,
            50,
        );
        assert_eq!(opt.merge_similar(vec![b.clone(), c], now).len(), 2);

        let d = rule(
            cond(&[
                (0, FeatureConstraint::at_most(0.9)),
                (1, FeatureConstraint::at_least(0.0)),
            ]),
            0,
            30,
        )
        .with_performance(0.5);
        let merged = opt.merge_similar(vec![b, d], now);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert_eq!(m.condition.get(0).unwrap().max, Some(0.9));
        assert_eq!(m.condition.get(1).unwrap().min, Some(0.0));
        assert_eq!(m.support, 80);
        assert!((m.performance - 0.25).abs() < 1e-12);
        assert!((m.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn merge_never_crosses_actions() {
        let c = cond(&[(0, FeatureConstraint::at_most(1.0))]);
        let d = cond(&[(0, FeatureConstraint::at_most(0.5))]);
        let merged = optimizer().merge_similar(vec![rule(c, 0, 10), rule(d, 1, 10)], Utc::now());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merged_rule_is_excluded_from_later_groups() {
        let now = Utc::now();
        let c1 = cond(&[(0, FeatureConstraint::at_most(1.0))]);
        let c2 = cond(&[(0, FeatureConstraint::at_most(0.8))]);
        let c3 = cond(&[(0, FeatureConstraint::at_most(0.6))]);
        let merged = optimizer().merge_similar(
            vec![rule(c1, 0, 10), rule(c2, 0, 10), rule(c3, 0, 10)],
            now,
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].support, 30);
        assert_eq!(merged[0].condition.get(0).unwrap().max, Some(0.6));
    }

    #[test]
    fn disjoint_bounds_are_not_merged() {
        let a = rule(cond(&[(0, FeatureConstraint::at_most(0.2))]), 0, 10);
        let b = rule(cond(&[(0, FeatureConstraint::at_least(0.8))]), 0, 10);
        assert_eq!(optimizer().merge_similar(vec![a, b], Utc::now()).len(), 2);
    }

    #[test]
    fn incompatible_member_does_not_block_merge() {
        let a = rule(cond(&[(0, FeatureConstraint::at_most(1.0))]), 0, 10);
        let b = rule(cond(&[(0, FeatureConstraint::at_most(0.9))]), 0, 20);
        let c = rule(cond(&[(0, FeatureConstraint::at_least(2.0))]), 0, 30);
        let c_id = c.id;

        let merged = optimizer().merge_similar(vec![a, b, c], Utc::now());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].condition, cond(&[(0, FeatureConstraint::at_most(0.9))]));
        assert_eq!(merged[0].support, 30);
        assert_eq!(merged[1].id, c_id);
    }

    #[test]
    fn truncation_keeps_best_rules() {
        let now = Utc::now();
        let opt = RuleOptimizer::new(
            OptimizeConfig {
                max_rules: 2,
                ..OptimizeConfig::default()
            },
            QualityWeights::default(),
        );
        let rules: Vec<PolicyRule> = [5u64, 500, 50]
            .iter()
            .enumerate()
            .map(|(i, &support)| rule(cond(&[(i, FeatureConstraint::at_most(1.0))]), 0, support))
            .collect();
        let kept = opt.truncate(rules, now);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].support, 500);
        assert_eq!(kept[1].support, 50);
    }

    #[test]
    fn config_validation() {
        assert!(OptimizeConfig::default().validate().is_ok());
        let bad = OptimizeConfig {
            max_rules: 0,
            ..OptimizeConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

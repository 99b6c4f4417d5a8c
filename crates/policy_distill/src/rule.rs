//! Condition → action rules and their quality scoring
//!
//! A [`PolicyRule`] is the unit of the compressed policy: a conjunction of
//! per-feature constraints, the action to take when all of them hold, and
//! rolling statistics fed back from real usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use uuid::Uuid;

use crate::errors::{DistillError, Result};

/// Index into a state vector
pub type FeatureIndex = usize;

/// Discrete action emitted by the oracle and by rules
pub type ActionId = usize;

/// Opaque rule identifier
pub type RuleId = Uuid;

/// Bounds placed on a single feature
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureConstraint {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub equals: Option<f64>,
}

impl FeatureConstraint {
    /// Create a constraint, rejecting `min > max`
    pub fn new(min: Option<f64>, max: Option<f64>, equals: Option<f64>) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(DistillError::InvalidConfig(format!(
                    "constraint min {lo} exceeds max {hi}"
                )));
            }
        }
        Ok(Self { min, max, equals })
    }

    pub fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            ..Self::default()
        }
    }

    pub fn at_most(max: f64) -> Self {
        Self {
            max: Some(max),
            ..Self::default()
        }
    }

    pub fn exactly(value: f64) -> Self {
        Self {
            equals: Some(value),
            ..Self::default()
        }
    }

    /// Whether `value` satisfies every present bound
    pub fn is_satisfied_by(&self, value: f64) -> bool {
        self.min.map_or(true, |lo| value >= lo)
            && self.max.map_or(true, |hi| value <= hi)
            && self.equals.map_or(true, |eq| value == eq)
    }

    /// Intersection of two constraints: the tighter bound on each side
    ///
    /// Fails when the intersection is empty (`min > max`).
    pub fn tighten(&self, other: &FeatureConstraint) -> Result<Self> {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self::new(min, max, self.equals.or(other.equals))
    }
}

/// Conjunction of feature constraints; an absent feature is unconstrained
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleCondition(BTreeMap<FeatureIndex, FeatureConstraint>);

impl RuleCondition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a condition from `(feature, constraint)` pairs, tightening duplicates
    pub fn from_constraints<I>(constraints: I) -> Result<Self>
    where
        I: IntoIterator<Item = (FeatureIndex, FeatureConstraint)>,
    {
        let mut condition = Self::new();
        for (feature, constraint) in constraints {
            condition.constrain(feature, constraint)?;
        }
        Ok(condition)
    }

    /// Add `constraint` on `feature`, intersecting with any existing bound
    pub fn constrain(&mut self, feature: FeatureIndex, constraint: FeatureConstraint) -> Result<()> {
        let merged = match self.0.get(&feature) {
            Some(existing) => existing.tighten(&constraint)?,
            None => FeatureConstraint::new(constraint.min, constraint.max, constraint.equals)?,
        };
        self.0.insert(feature, merged);
        Ok(())
    }

    pub fn get(&self, feature: FeatureIndex) -> Option<&FeatureConstraint> {
        self.0.get(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeatureIndex, &FeatureConstraint)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn features(&self) -> BTreeSet<FeatureIndex> {
        self.0.keys().copied().collect()
    }

    /// Whether `state` satisfies every constraint
    ///
    /// A constraint on a feature the state does not have is never satisfied.
    pub fn matches(&self, state: &[f64]) -> bool {
        self.0.iter().all(|(&feature, constraint)| {
            state
                .get(feature)
                .map_or(false, |&value| constraint.is_satisfied_by(value))
        })
    }

    /// `|common features| / |union of features|`; two empty conditions overlap fully
    pub fn overlap_ratio(&self, other: &RuleCondition) -> f64 {
        let mine = self.features();
        let theirs = other.features();
        let union = mine.union(&theirs).count();
        if union == 0 {
            return 1.0;
        }
        mine.intersection(&theirs).count() as f64 / union as f64
    }

    /// Intersect two conditions feature by feature
    pub fn intersect(&self, other: &RuleCondition) -> Result<RuleCondition> {
        let mut merged = self.clone();
        for (&feature, constraint) in other.iter() {
            merged.constrain(feature, *constraint)?;
        }
        Ok(merged)
    }

    /// Stable textual form, used for deduplication signatures
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (feature, c) in &self.0 {
            let _ = write!(
                out,
                "{feature}:[{},{},{}];",
                fmt_bound(c.min),
                fmt_bound(c.max),
                fmt_bound(c.equals)
            );
        }
        out
    }
}

fn fmt_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "_".to_string(), |v| format!("{v}"))
}

/// Diagnostic metadata computed when a rule is created
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Active feature count over the complexity normalizer
    pub complexity_score: f64,
    /// Fraction of the cycle's training samples the rule covers
    pub generalization_score: f64,
    /// `1 - support / specificity normalizer`, floored at zero
    pub specificity: f64,
}

/// Weights and constants of the quality score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub performance: f64,
    pub confidence: f64,
    pub support: f64,
    pub recency: f64,
    /// Support at which the support term saturates
    pub support_norm: f64,
    /// Time constant of the recency decay, in seconds
    pub recency_time_constant_secs: i64,
    /// Lower end of the reward range fed to `record_outcome`
    pub performance_min: f64,
    /// Upper end of the reward range fed to `record_outcome`
    pub performance_max: f64,
    /// EMA weight given to a new reward
    pub ema_alpha: f64,
    /// Confidence gained per recorded outcome
    pub confidence_step: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            performance: 0.4,
            confidence: 0.3,
            support: 0.2,
            recency: 0.1,
            support_norm: 100.0,
            recency_time_constant_secs: 7 * 24 * 3600,
            performance_min: -1.0,
            performance_max: 1.0,
            ema_alpha: 0.1,
            confidence_step: 0.01,
        }
    }
}

impl QualityWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.performance, self.confidence, self.support, self.recency];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(DistillError::InvalidConfig(
                "quality weights must be finite and non-negative".to_string(),
            ));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(DistillError::InvalidConfig(format!(
                "quality weights must sum to 1, got {total}"
            )));
        }
        if self.support_norm <= 0.0 || self.recency_time_constant_secs <= 0 {
            return Err(DistillError::InvalidConfig(
                "support_norm and recency time constant must be positive".to_string(),
            ));
        }
        if self.performance_max <= self.performance_min {
            return Err(DistillError::InvalidConfig(
                "performance_max must exceed performance_min".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ema_alpha) || !(0.0..=1.0).contains(&self.confidence_step) {
            return Err(DistillError::InvalidConfig(
                "ema_alpha and confidence_step must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Map an EMA performance value into `[0, 1]`
    pub fn normalize_performance(&self, performance: f64) -> f64 {
        let span = self.performance_max - self.performance_min;
        ((performance - self.performance_min) / span).clamp(0.0, 1.0)
    }

    /// Weighted quality score, always in `[0, 1]`
    ///
    /// A rule that has never been used gets full recency credit.
    pub fn score(
        &self,
        performance: f64,
        confidence: f64,
        support: u64,
        last_used: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64 {
        let performance_term = self.normalize_performance(performance);
        let confidence_term = sanitize_unit(confidence);
        let support_term = (support as f64 / self.support_norm).min(1.0);
        let elapsed_secs = last_used
            .map(|at| (now - at).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let recency_term = (-elapsed_secs / self.recency_time_constant_secs as f64).exp();

        let score = self.performance * performance_term
            + self.confidence * confidence_term
            + self.support * support_term
            + self.recency * recency_term;

        sanitize_unit(score)
    }
}

/// Signature of a `(condition, action)` pair, shared by every dedup site
pub(crate) fn rule_signature(condition: &RuleCondition, action: ActionId) -> String {
    format!("{}=>{}", condition.canonical_string(), action)
}

/// Clamp into `[0, 1]`, mapping NaN to 0
pub(crate) fn sanitize_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A distilled condition → action rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: RuleId,
    pub condition: RuleCondition,
    pub action: ActionId,
    pub confidence: f64,
    pub support: u64,
    pub performance: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub metadata: RuleMetadata,
}

impl PolicyRule {
    /// Create a fresh, never-used rule with neutral performance
    pub fn new(
        condition: RuleCondition,
        action: ActionId,
        confidence: f64,
        support: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            condition,
            action,
            confidence: sanitize_unit(confidence),
            support,
            performance: 0.0,
            created_at,
            last_used_at: None,
            usage_count: 0,
            metadata: RuleMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: RuleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_performance(mut self, performance: f64) -> Self {
        self.performance = performance;
        self
    }

    /// Deduplication key: the serialized `(condition, action)` pair
    pub fn signature(&self) -> String {
        rule_signature(&self.condition, self.action)
    }

    pub fn applies_to(&self, state: &[f64]) -> bool {
        self.condition.matches(state)
    }

    pub fn quality_score(&self, weights: &QualityWeights, now: DateTime<Utc>) -> f64 {
        weights.score(
            self.performance,
            self.confidence,
            self.support,
            self.last_used_at,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn condition(pairs: &[(usize, FeatureConstraint)]) -> RuleCondition {
        RuleCondition::from_constraints(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn constraint_rejects_inverted_bounds() {
        assert!(FeatureConstraint::new(Some(2.0), Some(1.0), None).is_err());
        assert!(FeatureConstraint::new(Some(1.0), Some(1.0), None).is_ok());
    }

    #[test]
    fn constraint_satisfaction() {
        let c = FeatureConstraint::new(Some(0.0), Some(1.0), None).unwrap();
        assert!(c.is_satisfied_by(0.0));
        assert!(c.is_satisfied_by(1.0));
        assert!(!c.is_satisfied_by(1.0001));
        assert!(FeatureConstraint::exactly(5.0).is_satisfied_by(5.0));
        assert!(!FeatureConstraint::exactly(5.0).is_satisfied_by(5.1));
        assert!(FeatureConstraint::default().is_satisfied_by(f64::MAX));
    }

    #[test]
    fn tighten_takes_innermost_bounds() {
        let a = FeatureConstraint::new(Some(0.0), Some(1.0), None).unwrap();
        let b = FeatureConstraint::new(Some(0.2), Some(0.9), Some(0.5)).unwrap();
        let t = a.tighten(&b).unwrap();

        assert_eq!(t.min, Some(0.2));
        assert_eq!(t.max, Some(0.9));
        assert_eq!(t.equals, Some(0.5));
        assert!(FeatureConstraint::at_least(2.0)
            .tighten(&FeatureConstraint::at_most(1.0))
            .is_err());
    }

    #[test]
    fn condition_matching_and_missing_features() {
        let cond = condition(&[
            (0, FeatureConstraint::at_most(1.0)),
            (2, FeatureConstraint::at_least(0.0)),
        ]);

        assert!(cond.matches(&[0.5, 99.0, 3.0]));
        assert!(!cond.matches(&[1.5, 0.0, 3.0]));
        assert!(!cond.matches(&[0.5]));
        assert!(RuleCondition::new().matches(&[]));
    }

    #[test]
    fn overlap_ratio_counts_feature_sets() {
        let a = condition(&[(0, FeatureConstraint::at_most(1.0))]);
        let b = condition(&[
            (0, FeatureConstraint::at_most(1.0)),
            (1, FeatureConstraint::at_least(0.0)),
        ]);
        let c = condition(&[
            (0, FeatureConstraint::at_most(1.0)),
            (1, FeatureConstraint::at_least(0.0)),
            (2, FeatureConstraint::exactly(5.0)),
        ]);

        assert!((a.overlap_ratio(&b) - 0.5).abs() < 1e-12);
        assert!((b.overlap_ratio(&c) - 2.0 / 3.0).abs() < 1e-12);
        assert!((b.overlap_ratio(&b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn signature_distinguishes_action_and_bounds() {
        let now = Utc::now();
        let cond = condition(&[(0, FeatureConstraint::at_most(0.5))]);
        let r1 = PolicyRule::new(cond.clone(), 1, 0.9, 10, now);
        let r2 = PolicyRule::new(cond.clone(), 1, 0.2, 99, now);
        let r3 = PolicyRule::new(cond, 0, 0.9, 10, now);
        let r4 = PolicyRule::new(condition(&[(0, FeatureConstraint::at_most(0.6))]), 1, 0.9, 10, now);

        assert_eq!(r1.signature(), r2.signature());
        assert_ne!(r1.signature(), r3.signature());
        assert_ne!(r1.signature(), r4.signature());
        assert_ne!(r1.id, r2.id);
    }

    #[test]
    fn quality_score_matches_weighted_formula() {
        let weights = QualityWeights::default();
        let now = Utc::now();
        // 0.4 * 0.5 + 0.3 * 0.6 + 0.2 * 0.05 + 0.1 * 1.0
        let score = weights.score(0.0, 0.6, 5, None, now);
        assert!((score - 0.49).abs() < 1e-9, "score {score}");

        let week_ago = now - Duration::days(7);
        let decayed = weights.score(0.0, 0.6, 5, Some(week_ago), now);
        let expected = 0.2 + 0.18 + 0.01 + 0.1 * (-1.0f64).exp();
        assert!((decayed - expected).abs() < 1e-9);
    }

    #[test]
    fn quality_score_is_bounded_for_extreme_inputs() {
        let weights = QualityWeights::default();
        let now = Utc::now();
        for &(perf, conf) in &[(100.0, 5.0), (-100.0, -5.0), (f64::NAN, f64::NAN)] {
            let s = weights.score(perf, conf, u64::MAX, Some(now + Duration::days(1)), now);
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn quality_weights_validation() {
        assert!(QualityWeights::default().validate().is_ok());
        let skewed = QualityWeights {
            performance: 0.9,
            ..QualityWeights::default()
        };
        assert!(skewed.validate().is_err());
    }
}

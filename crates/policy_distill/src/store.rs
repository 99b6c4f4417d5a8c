//! Long-lived, concurrently accessed rule store
//!
//! Readers (`predict`, `stats`, `snapshot`) and feedback writers
//! (`record_outcome`) share a read lock; feedback mutates per-rule atomics.
//! Structural changes (`insert_all`, `prune`, `restore`) take the write lock,
//! so a reader never sees a half-applied insertion or removal.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::{millis_to_datetime, Clock, SystemClock};
use crate::errors::{DistillError, Result};
use crate::rule::{
    rule_signature, ActionId, PolicyRule, QualityWeights, RuleCondition, RuleId, RuleMetadata,
};

const NEVER: i64 = i64::MIN;

/// f64 stored as bits, updated with compare-and-swap
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current)).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

fn encode_time(at: Option<DateTime<Utc>>) -> i64 {
    at.map_or(NEVER, |t| t.timestamp_millis())
}

fn decode_time(millis: i64) -> Option<DateTime<Utc>> {
    (millis != NEVER).then(|| millis_to_datetime(millis))
}

/// A rule as held by the store: immutable shape plus atomic statistics
#[derive(Debug)]
struct StoredRule {
    id: RuleId,
    condition: RuleCondition,
    action: ActionId,
    support: u64,
    created_at: DateTime<Utc>,
    metadata: RuleMetadata,
    confidence: AtomicF64,
    performance: AtomicF64,
    usage_count: AtomicU64,
    last_used_ms: AtomicI64,
}

impl StoredRule {
    fn from_rule(rule: PolicyRule) -> Self {
        Self {
            id: rule.id,
            condition: rule.condition,
            action: rule.action,
            support: rule.support,
            created_at: rule.created_at,
            metadata: rule.metadata,
            confidence: AtomicF64::new(rule.confidence),
            performance: AtomicF64::new(rule.performance),
            usage_count: AtomicU64::new(rule.usage_count),
            last_used_ms: AtomicI64::new(encode_time(rule.last_used_at)),
        }
    }

    fn last_used(&self) -> Option<DateTime<Utc>> {
        decode_time(self.last_used_ms.load(Ordering::Acquire))
    }

    fn quality(&self, weights: &QualityWeights, now: DateTime<Utc>) -> f64 {
        weights.score(
            self.performance.load(),
            self.confidence.load(),
            self.support,
            self.last_used(),
            now,
        )
    }

    fn to_rule(&self) -> PolicyRule {
        PolicyRule {
            id: self.id,
            condition: self.condition.clone(),
            action: self.action,
            confidence: self.confidence.load(),
            support: self.support,
            performance: self.performance.load(),
            created_at: self.created_at,
            last_used_at: self.last_used(),
            usage_count: self.usage_count.load(Ordering::Acquire),
            metadata: self.metadata,
        }
    }

    fn signature(&self) -> String {
        rule_signature(&self.condition, self.action)
    }

    fn rank_key(&self, quality: f64) -> RankKey<'_> {
        RankKey {
            quality,
            support: self.support,
            created_at: self.created_at,
            id: &self.id,
        }
    }
}

/// Usage statistics tracked alongside each rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub times_used: u64,
    pub total_performance: f64,
    pub last_used: Option<DateTime<Utc>>,
    /// When the rule entered this store
    pub created: DateTime<Utc>,
}

impl UsageStats {
    pub fn fresh(created: DateTime<Utc>) -> Self {
        Self {
            times_used: 0,
            total_performance: 0.0,
            last_used: None,
            created,
        }
    }

    /// Mean observed reward, `None` before the first outcome
    pub fn average_performance(&self) -> Option<f64> {
        (self.times_used > 0).then(|| self.total_performance / self.times_used as f64)
    }
}

#[derive(Debug)]
struct UsageCounters {
    times_used: AtomicU64,
    total_performance: AtomicF64,
    last_used_ms: AtomicI64,
    created: DateTime<Utc>,
}

impl UsageCounters {
    fn from_stats(stats: UsageStats) -> Self {
        Self {
            times_used: AtomicU64::new(stats.times_used),
            total_performance: AtomicF64::new(stats.total_performance),
            last_used_ms: AtomicI64::new(encode_time(stats.last_used)),
            created: stats.created,
        }
    }

    fn snapshot(&self) -> UsageStats {
        UsageStats {
            times_used: self.times_used.load(Ordering::Acquire),
            total_performance: self.total_performance.load(),
            last_used: decode_time(self.last_used_ms.load(Ordering::Acquire)),
            created: self.created,
        }
    }
}

/// Outcome of [`RuleStore::predict`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prediction {
    /// The best applicable rule decided
    Rule {
        rule_id: RuleId,
        action: ActionId,
        confidence: f64,
        quality: f64,
    },
    /// No rule applied; the caller should treat this as "no opinion"
    Fallback { action: ActionId, confidence: f64 },
}

impl Prediction {
    pub fn action(&self) -> ActionId {
        match self {
            Self::Rule { action, .. } | Self::Fallback { action, .. } => *action,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Self::Rule { confidence, .. } | Self::Fallback { confidence, .. } => *confidence,
        }
    }

    pub fn rule_id(&self) -> Option<RuleId> {
        match self {
            Self::Rule { rule_id, .. } => Some(*rule_id),
            Self::Fallback { .. } => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Pruning thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneConfig {
    /// Rules scoring below this are removed
    pub quality_threshold: f64,
    /// Never-used rules older than this are removed, in seconds
    pub unused_ttl_secs: i64,
    /// Used rules whose mean reward is below this are removed
    pub poor_performance_floor: f64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.3,
            unused_ttl_secs: 24 * 3600,
            poor_performance_floor: -0.5,
        }
    }
}

impl PruneConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(DistillError::InvalidConfig(format!(
                "prune.quality_threshold {} outside [0, 1]",
                self.quality_threshold
            )));
        }
        if self.unused_ttl_secs < 0 {
            return Err(DistillError::InvalidConfig(
                "unused_ttl_secs must not be negative".to_string(),
            ));
        }
        if !self.poor_performance_floor.is_finite() {
            return Err(DistillError::InvalidConfig(
                "poor_performance_floor must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn unused_ttl(&self) -> Duration {
        Duration::seconds(self.unused_ttl_secs)
    }
}

/// Counts produced by [`RuleStore::prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub before: usize,
    pub after: usize,
    pub removed: usize,
    pub removed_low_quality: usize,
    pub removed_unused: usize,
    pub removed_poor_performance: usize,
}

/// Aggregate view over the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_rules: usize,
    pub avg_quality: f64,
    /// Rules bucketed by usage count: `0`, `1-9`, `10-99`, `100+`
    pub usage_histogram: BTreeMap<String, u64>,
    pub action_counts: BTreeMap<ActionId, usize>,
    pub total_usage: u64,
}

fn usage_bucket(count: u64) -> &'static str {
    match count {
        0 => "0",
        1..=9 => "1-9",
        10..=99 => "10-99",
        _ => "100+",
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    rules: HashMap<RuleId, StoredRule>,
    usage: HashMap<RuleId, UsageCounters>,
    signatures: HashSet<String>,
}

impl StoreInner {
    fn insert(&mut self, rule: PolicyRule, stats: UsageStats) -> bool {
        if self.rules.contains_key(&rule.id) {
            return false;
        }
        let stored = StoredRule::from_rule(rule);
        if !self.signatures.insert(stored.signature()) {
            return false;
        }
        self.usage.insert(stored.id, UsageCounters::from_stats(stats));
        self.rules.insert(stored.id, stored);
        true
    }
}

/// Authoritative collection of active rules
pub struct RuleStore {
    inner: RwLock<StoreInner>,
    weights: QualityWeights,
    default_action: ActionId,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("rules", &self.len())
            .field("default_action", &self.default_action)
            .finish()
    }
}

impl RuleStore {
    /// Create an empty store on the system clock
    pub fn new(weights: QualityWeights, default_action: ActionId) -> Self {
        Self::with_clock(weights, default_action, Arc::new(SystemClock))
    }

    pub fn with_clock(weights: QualityWeights, default_action: ActionId, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            weights,
            default_action,
            clock,
        }
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.inner.read().rules.contains_key(id)
    }

    /// Union `rules` into the store; returns how many were new
    ///
    /// A rule whose id or `(condition, action)` signature is already present
    /// is skipped, leaving the existing rule and its statistics untouched.
    pub fn insert_all(&self, rules: Vec<PolicyRule>) -> usize {
        let now = self.clock.now();
        let offered = rules.len();
        let mut inner = self.inner.write();
        let inserted = rules
            .into_iter()
            .map(|rule| inner.insert(rule, UsageStats::fresh(now)))
            .filter(|&added| added)
            .count();
        drop(inner);

        debug!(offered, inserted, "rules inserted");
        inserted
    }

    /// Insert rules together with previously recorded usage statistics
    pub fn restore(&self, entries: Vec<(PolicyRule, UsageStats)>) -> usize {
        let mut inner = self.inner.write();
        entries
            .into_iter()
            .map(|(rule, stats)| inner.insert(rule, stats))
            .filter(|&added| added)
            .count()
    }

    /// Best applicable rule for `state`, or the fallback
    ///
    /// Ranking: quality, then support, then earliest creation, then id.
    pub fn predict(&self, state: &[f64]) -> Prediction {
        let now = self.clock.now();
        let inner = self.inner.read();

        let best = inner
            .rules
            .values()
            .filter(|rule| rule.condition.matches(state))
            .map(|rule| (rule, rule.quality(&self.weights, now)))
            .max_by(|(a, qa), (b, qb)| a.rank_key(*qa).compare(&b.rank_key(*qb)));

        match best {
            Some((rule, quality)) => Prediction::Rule {
                rule_id: rule.id,
                action: rule.action,
                confidence: rule.confidence.load(),
                quality,
            },
            None => Prediction::Fallback {
                action: self.default_action,
                confidence: 0.0,
            },
        }
    }

    /// Apply outcome feedback to a rule; `false` if the rule is gone
    pub fn record_outcome(&self, rule_id: &RuleId, reward: f64) -> bool {
        if !reward.is_finite() {
            warn!(%rule_id, reward, "ignoring non-finite reward");
            return false;
        }
        let now_ms = self.clock.now().timestamp_millis();
        let alpha = self.weights.ema_alpha;
        let step = self.weights.confidence_step;

        let inner = self.inner.read();
        let Some(rule) = inner.rules.get(rule_id) else {
            debug!(%rule_id, "outcome for unknown rule");
            return false;
        };

        rule.performance.update(|p| (1.0 - alpha) * p + alpha * reward);
        rule.confidence.update(|c| (c + step).min(1.0));
        rule.usage_count.fetch_add(1, Ordering::AcqRel);
        rule.last_used_ms.fetch_max(now_ms, Ordering::AcqRel);

        if let Some(usage) = inner.usage.get(rule_id) {
            usage.times_used.fetch_add(1, Ordering::AcqRel);
            usage.total_performance.update(|t| t + reward);
            usage.last_used_ms.fetch_max(now_ms, Ordering::AcqRel);
        }
        true
    }

    /// Remove low-quality, stale, or poorly performing rules
    #[instrument(skip(self, config))]
    pub fn prune(&self, config: &PruneConfig) -> Result<PruneReport> {
        config.validate()?;
        let now = self.clock.now();
        let ttl = config.unused_ttl();

        let mut inner = self.inner.write();
        let before = inner.rules.len();
        let mut report = PruneReport {
            before,
            ..PruneReport::default()
        };

        let doomed: Vec<RuleId> = inner
            .rules
            .values()
            .filter(|rule| {
                let usage = inner.usage.get(&rule.id).map(UsageCounters::snapshot);
                let uses = rule.usage_count.load(Ordering::Acquire);
                let created = usage.map_or(rule.created_at, |u| u.created);

                if rule.quality(&self.weights, now) < config.quality_threshold {
                    report.removed_low_quality += 1;
                    true
                } else if uses == 0 && now - created > ttl {
                    report.removed_unused += 1;
                    true
                } else if uses > 0
                    && usage
                        .and_then(|u| u.average_performance())
                        .map_or(false, |avg| avg < config.poor_performance_floor)
                {
                    report.removed_poor_performance += 1;
                    true
                } else {
                    false
                }
            })
            .map(|rule| rule.id)
            .collect();

        for id in &doomed {
            if let Some(rule) = inner.rules.remove(id) {
                inner.signatures.remove(&rule.signature());
            }
            inner.usage.remove(id);
        }

        report.after = inner.rules.len();
        report.removed = before - report.after;
        drop(inner);

        info!(
            before = report.before,
            after = report.after,
            low_quality = report.removed_low_quality,
            unused = report.removed_unused,
            poor_performance = report.removed_poor_performance,
            "rule store pruned"
        );
        Ok(report)
    }

    pub fn get(&self, id: &RuleId) -> Option<PolicyRule> {
        self.inner.read().rules.get(id).map(StoredRule::to_rule)
    }

    pub fn usage_stats(&self, id: &RuleId) -> Option<UsageStats> {
        self.inner.read().usage.get(id).map(UsageCounters::snapshot)
    }

    pub fn quality_of(&self, id: &RuleId) -> Option<f64> {
        let now = self.clock.now();
        self.inner
            .read()
            .rules
            .get(id)
            .map(|rule| rule.quality(&self.weights, now))
    }

    /// Owned copies of every rule, oldest first
    pub fn snapshot(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self
            .inner
            .read()
            .rules
            .values()
            .map(StoredRule::to_rule)
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    /// Rules paired with their usage statistics, oldest first
    pub fn snapshot_with_usage(&self) -> Vec<(PolicyRule, UsageStats)> {
        let inner = self.inner.read();
        let mut entries: Vec<(PolicyRule, UsageStats)> = inner
            .rules
            .values()
            .map(|rule| {
                let stats = inner
                    .usage
                    .get(&rule.id)
                    .map(UsageCounters::snapshot)
                    .unwrap_or_else(|| UsageStats::fresh(rule.created_at));
                (rule.to_rule(), stats)
            })
            .collect();
        drop(inner);
        entries.sort_by(|a, b| {
            a.0.created_at
                .cmp(&b.0.created_at)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        entries
    }

    pub fn stats(&self) -> EngineStats {
        let now = self.clock.now();
        let inner = self.inner.read();
        let mut stats = EngineStats {
            total_rules: inner.rules.len(),
            ..EngineStats::default()
        };
        for bucket in ["0", "1-9", "10-99", "100+"] {
            stats.usage_histogram.insert(bucket.to_string(), 0);
        }

        let mut quality_sum = 0.0;
        for rule in inner.rules.values() {
            let uses = rule.usage_count.load(Ordering::Acquire);
            quality_sum += rule.quality(&self.weights, now);
            stats.total_usage += uses;
            *stats
                .usage_histogram
                .entry(usage_bucket(uses).to_string())
                .or_insert(0) += 1;
            *stats.action_counts.entry(rule.action).or_insert(0) += 1;
        }
        if stats.total_rules > 0 {
            stats.avg_quality = quality_sum / stats.total_rules as f64;
        }
        stats
    }
}

/// Ranking key shared by [`RuleStore::predict`] and [`rank_rules`]
struct RankKey<'a> {
    quality: f64,
    support: u64,
    created_at: DateTime<Utc>,
    id: &'a RuleId,
}

impl<'a> RankKey<'a> {
    fn of(rule: &'a PolicyRule, weights: &QualityWeights, now: DateTime<Utc>) -> Self {
        Self {
            quality: rule.quality_score(weights, now),
            support: rule.support,
            created_at: rule.created_at,
            id: &rule.id,
        }
    }

    /// Greater wins: quality, then support, then earliest creation, then lowest id
    fn compare(&self, other: &Self) -> CmpOrdering {
        self.quality
            .total_cmp(&other.quality)
            .then_with(|| self.support.cmp(&other.support))
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(self.id))
    }
}

/// Order two rules the way [`RuleStore::predict`] ranks them
pub fn rank_rules(a: &PolicyRule, b: &PolicyRule, weights: &QualityWeights, now: DateTime<Utc>) -> CmpOrdering {
    RankKey::of(a, weights, now).compare(&RankKey::of(b, weights, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rule::FeatureConstraint;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn store_at(clock: Arc<ManualClock>) -> RuleStore {
        RuleStore::with_clock(QualityWeights::default(), 7, clock)
    }

    fn rule(max: f64, action: ActionId, support: u64, confidence: f64) -> PolicyRule {
        let condition = RuleCondition::from_constraints([(0, FeatureConstraint::at_most(max))]).unwrap();
        PolicyRule::new(condition, action, confidence, support, start())
    }

    #[test]
    fn predict_falls_back_when_nothing_applies() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        store.insert_all(vec![rule(1.0, 1, 50, 0.9)]);

        let prediction = store.predict(&[5.0]);
        assert_eq!(
            prediction,
            Prediction::Fallback {
                action: 7,
                confidence: 0.0
            }
        );
        assert!(store.predict(&[0.5]).rule_id().is_some());
    }

    #[test]
    fn predict_prefers_quality_then_support() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        let weak = rule(1.0, 1, 5, 0.6);
        let strong = rule(2.0, 2, 500, 0.6);
        let strong_id = strong.id;
        store.insert_all(vec![weak, strong]);

        let prediction = store.predict(&[0.5]);
        assert_eq!(prediction.rule_id(), Some(strong_id));
        assert_eq!(prediction.action(), 2);
    }

    #[test]
    fn predict_breaks_full_ties_by_creation_time() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        let newer = rule(1.0, 1, 50, 0.8);
        let mut older = rule(1.0, 2, 50, 0.8);
        older.created_at = start() - Duration::hours(1);
        let older_id = older.id;
        assert_eq!(newer.quality_score(store.weights(), start()), older.quality_score(store.weights(), start()));

        assert_eq!(
            rank_rules(&older, &newer, store.weights(), start()),
            CmpOrdering::Greater
        );
        store.insert_all(vec![newer, older]);
        assert_eq!(store.predict(&[0.5]).rule_id(), Some(older_id));
    }

    #[test]
    fn insert_all_skips_duplicate_signatures() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        assert_eq!(store.insert_all(vec![rule(1.0, 1, 5, 0.6), rule(1.0, 1, 50, 0.9)]), 1);
        assert_eq!(store.insert_all(vec![rule(1.0, 1, 5, 0.6)]), 0);
        assert_eq!(store.insert_all(vec![rule(1.0, 2, 5, 0.6)]), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn record_outcome_updates_ema_and_confidence() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_at(clock.clone());
        let r = rule(1.0, 1, 50, 0.995);
        let id = r.id;
        store.insert_all(vec![r]);

        clock.advance(Duration::minutes(5));
        assert!(store.record_outcome(&id, 1.0));
        assert!(store.record_outcome(&id, 1.0));

        let updated = store.get(&id).unwrap();
        assert!((updated.performance - 0.19).abs() < 1e-12);
        assert_eq!(updated.confidence, 1.0);
        assert_eq!(updated.usage_count, 2);
        assert_eq!(updated.last_used_at, Some(clock.now()));

        let usage = store.usage_stats(&id).unwrap();
        assert_eq!(usage.times_used, 2);
        assert!((usage.total_performance - 2.0).abs() < 1e-12);
        assert_eq!(usage.average_performance(), Some(1.0));
    }

    #[test]
    fn record_outcome_on_unknown_rule_is_a_noop() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        assert!(!store.record_outcome(&uuid::Uuid::new_v4(), 1.0));
    }

    #[test]
    fn prune_removes_stale_unused_rules() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_at(clock.clone());
        let old = rule(1.0, 1, 50, 0.9);
        let old_id = old.id;
        store.insert_all(vec![old]);

        clock.advance(Duration::hours(46));
        let young = rule(2.0, 1, 50, 0.9);
        let young_id = young.id;
        store.insert_all(vec![young]);
        clock.advance(Duration::hours(2));

        let report = store.prune(&PruneConfig::default()).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.removed_unused, 1);
        assert!(!store.contains(&old_id));
        assert!(store.contains(&young_id));
    }

    #[test]
    fn prune_removes_poor_performers_and_low_quality() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = store_at(clock.clone());
        let poor = rule(1.0, 1, 500, 0.9);
        let poor_id = poor.id;
        let flimsy = rule(2.0, 1, 0, 0.0).with_performance(-1.0);
        let good = rule(3.0, 2, 500, 0.9);
        let good_id = good.id;
        store.insert_all(vec![poor, flimsy, good]);

        for _ in 0..3 {
            store.record_outcome(&poor_id, -1.0);
        }
        store.record_outcome(&good_id, 0.5);

        let report = store.prune(&PruneConfig::default()).unwrap();
        assert_eq!(report.before, 3);
        assert_eq!(report.after, 1);
        assert_eq!(report.removed_low_quality, 1);
        assert_eq!(report.removed_poor_performance, 1);
        assert!(store.contains(&good_id));

        // A pruned signature can be inserted again
        assert_eq!(store.insert_all(vec![rule(1.0, 1, 5, 0.6)]), 1);
    }

    #[test]
    fn prune_rejects_invalid_config() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        let bad = PruneConfig {
            quality_threshold: 2.0,
            ..PruneConfig::default()
        };
        assert!(matches!(store.prune(&bad), Err(DistillError::InvalidConfig(_))));
    }

    #[test]
    fn stats_histogram_and_average() {
        let store = store_at(Arc::new(ManualClock::new(start())));
        let a = rule(1.0, 1, 50, 0.9);
        let a_id = a.id;
        store.insert_all(vec![a, rule(2.0, 2, 50, 0.9)]);
        for _ in 0..12 {
            store.record_outcome(&a_id, 0.0);
        }

        let stats = store.stats();
        assert_eq!(stats.total_rules, 2);
        assert_eq!(stats.usage_histogram["0"], 1);
        assert_eq!(stats.usage_histogram["10-99"], 1);
        assert_eq!(stats.usage_histogram["1-9"], 0);
        assert_eq!(stats.total_usage, 12);
        assert_eq!(stats.action_counts[&1], 1);
        assert!(stats.avg_quality > 0.0 && stats.avg_quality <= 1.0);
    }

    #[test]
    fn concurrent_feedback_and_reads() {
        let store = Arc::new(store_at(Arc::new(ManualClock::new(start()))));
        let rules: Vec<PolicyRule> = (0..8).map(|i| rule(i as f64, 1, 50, 0.5)).collect();
        let ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
        store.insert_all(rules);

        std::thread::scope(|scope| {
            for id in &ids {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..100 {
                        assert!(store.record_outcome(id, 0.5));
                    }
                });
            }
            for _ in 0..4 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..200 {
                        assert!(!store.predict(&[0.0]).is_fallback());
                    }
                });
            }
        });

        for id in &ids {
            let r = store.get(id).unwrap();
            assert_eq!(r.usage_count, 100);
            assert!((r.confidence - 1.0).abs() < 1e-9);
        }
    }
}

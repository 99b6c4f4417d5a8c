//! Distillation engine
//!
//! Wires the sampler, tree builder, optimizer and store together and exposes
//! the operations callers use: `distill`, `predict`, `record_outcome`,
//! `prune`, `stats`, plus explicit persistence hooks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cart::TreeBuilder;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::deterministic::seeded_rng;
use crate::errors::{DistillError, Result};
use crate::optimizer::RuleOptimizer;
use crate::persistence::{PolicyRuleSerialized, RulePersistence};
use crate::rule::{ActionId, PolicyRule, QualityWeights, RuleId};
use crate::sampler::{BehaviorSampler, FeatureImportance, PolicyOracle, Sample, StateDistribution};
use crate::store::{rank_rules, EngineStats, Prediction, PruneReport, RuleStore};

/// Outcome of one distillation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistillationReport {
    pub samples_analyzed: usize,
    /// Rules read off the tree, one per reachable leaf
    pub rules_extracted: usize,
    pub rules_after_optimization: usize,
    /// Rules that were new to the store
    pub rules_inserted: usize,
    pub tree_depth: usize,
    pub tree_leaves: usize,
    /// `samples_analyzed / max(rules_after_optimization, 1)`
    pub compression_ratio: f64,
    /// Share of analysed samples on which the optimized rules agree with the oracle
    pub estimated_performance_preservation: f64,
    pub feature_importance: Vec<FeatureImportance>,
    pub action_histogram: BTreeMap<ActionId, usize>,
}

/// Clears the in-progress flag when a cycle ends, however it ends
struct DistillGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DistillGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DistillGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Policy distillation engine
///
/// Shareable across threads; `distill` runs are serialized, everything else
/// goes straight to the [`RuleStore`].
pub struct DistillationEngine {
    config: EngineConfig,
    store: Arc<RuleStore>,
    sampler: BehaviorSampler,
    distilling: AtomicBool,
    cycles: AtomicU64,
}

impl std::fmt::Debug for DistillationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistillationEngine")
            .field("rules", &self.store.len())
            .field("distilling", &self.is_distilling())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}

impl DistillationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build an engine whose store reads time from `clock`
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = RuleStore::with_clock(config.quality.clone(), config.default_action, clock);
        Self {
            sampler: BehaviorSampler::new(config.sampler.clone()),
            store: Arc::new(store),
            config,
            distilling: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn is_distilling(&self) -> bool {
        self.distilling.load(Ordering::Acquire)
    }

    /// Sample `oracle`, grow a tree, and merge the optimized rules into the store
    ///
    /// Zero samples is not an error: the report simply carries no rules.
    /// Each cycle draws from `seed + cycle index`, so a fresh engine replays
    /// the same first cycle for the same seed.
    #[instrument(skip(self, oracle, distribution), fields(n = n))]
    pub fn distill<O>(
        &self,
        oracle: &O,
        distribution: &StateDistribution,
        n: usize,
    ) -> Result<DistillationReport>
    where
        O: PolicyOracle + ?Sized,
    {
        self.config.tree.validate()?;
        self.config.optimize.validate()?;
        self.config.sampler.validate()?;
        self.config.quality.validate()?;

        let Some(_guard) = DistillGuard::acquire(&self.distilling) else {
            warn!("distillation already in progress");
            return Err(DistillError::DistillationInProgress);
        };

        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel);
        let mut rng = seeded_rng(self.config.seed.wrapping_add(cycle));

        let analysis = self.sampler.analyze(oracle, distribution, n, &mut rng)?;
        let samples_analyzed = analysis.samples.len();

        let builder = TreeBuilder::new(self.config.tree.clone());
        let tree = match builder.build(&analysis.samples, &mut rng) {
            Ok(tree) => tree,
            Err(DistillError::EmptyTrainingSet) => {
                info!("no samples collected; nothing to distill");
                return Ok(DistillationReport {
                    samples_analyzed,
                    feature_importance: analysis.feature_importance,
                    action_histogram: analysis.action_histogram,
                    ..DistillationReport::default()
                });
            }
            Err(err) => return Err(err),
        };
        debug!(
            depth = tree.depth(),
            leaves = tree.leaf_count(),
            nodes = tree.node_count(),
            "tree grown"
        );

        let now = self.store.now();
        let optimizer = RuleOptimizer::new(self.config.optimize.clone(), self.config.quality.clone());
        let extracted = optimizer.extract_rules(&tree, now);
        let rules_extracted = extracted.len();
        let optimized = optimizer.optimize(extracted, now);
        let rules_after_optimization = optimized.len();

        let estimated_performance_preservation = agreement_rate(
            &optimized,
            &analysis.samples,
            &self.config.quality,
            self.config.default_action,
            now,
        );
        let rules_inserted = self.store.insert_all(optimized);

        let report = DistillationReport {
            samples_analyzed,
            rules_extracted,
            rules_after_optimization,
            rules_inserted,
            tree_depth: tree.depth(),
            tree_leaves: tree.leaf_count(),
            compression_ratio: samples_analyzed as f64 / rules_after_optimization.max(1) as f64,
            estimated_performance_preservation,
            feature_importance: analysis.feature_importance,
            action_histogram: analysis.action_histogram,
        };

        info!(
            cycle,
            samples = report.samples_analyzed,
            extracted = report.rules_extracted,
            optimized = report.rules_after_optimization,
            inserted = report.rules_inserted,
            compression = report.compression_ratio,
            preservation = report.estimated_performance_preservation,
            total_rules = self.store.len(),
            "distillation complete"
        );
        Ok(report)
    }

    /// Hot-path prediction; never fails
    pub fn predict(&self, state: &[f64]) -> Prediction {
        self.store.predict(state)
    }

    /// Feed back the reward observed after acting on a rule's prediction
    pub fn record_outcome(&self, rule_id: &RuleId, reward: f64) -> bool {
        self.store.record_outcome(rule_id, reward)
    }

    /// Prune with the configured thresholds
    #[instrument(skip(self))]
    pub fn prune(&self) -> Result<PruneReport> {
        self.store.prune(&self.config.prune)
    }

    pub fn stats(&self) -> EngineStats {
        self.store.stats()
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.store.snapshot()
    }

    /// Merge persisted rules into the store; returns how many were added
    ///
    /// Failures are logged and the engine keeps serving from memory.
    #[instrument(skip(self, persistence))]
    pub fn load_from(&self, persistence: &dyn RulePersistence) -> usize {
        let records = match persistence.load() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to load persisted rules; continuing in memory");
                return 0;
            }
        };
        let offered = records.len();

        let entries: Vec<_> = records
            .into_iter()
            .filter_map(|record| {
                let id = record.id;
                match record.into_entry() {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!(rule_id = %id, error = %err, "skipping invalid persisted rule");
                        None
                    }
                }
            })
            .collect();
        let restored = self.store.restore(entries);

        info!(offered, restored, "persisted rules loaded");
        restored
    }

    /// Save every rule and its usage statistics; returns the number saved
    #[instrument(skip(self, persistence))]
    pub fn checkpoint(&self, persistence: &dyn RulePersistence) -> Result<usize> {
        let records: Vec<PolicyRuleSerialized> = self
            .store
            .snapshot_with_usage()
            .iter()
            .map(|(rule, usage)| PolicyRuleSerialized::from_rule(rule, Some(usage)))
            .collect();

        if let Err(err) = persistence.save(&records) {
            warn!(error = %err, "checkpoint failed; rules remain in memory");
            return Err(err);
        }
        info!(rules = records.len(), "checkpoint written");
        Ok(records.len())
    }
}

/// Fraction of samples where the best applicable rule (or the fallback)
/// picks the sampled action
fn agreement_rate(
    rules: &[PolicyRule],
    samples: &[Sample],
    weights: &QualityWeights,
    default_action: ActionId,
    now: chrono::DateTime<chrono::Utc>,
) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let agreeing = samples
        .iter()
        .filter(|sample| {
            let chosen = rules
                .iter()
                .filter(|rule| rule.applies_to(&sample.state))
                .max_by(|a, b| rank_rules(a, b, weights, now))
                .map_or(default_action, |rule| rule.action);
            chosen == sample.action
        })
        .count();
    agreeing as f64 / samples.len() as f64
}

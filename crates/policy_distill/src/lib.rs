//! IPPAN Policy Distillation - interpretable rule sets from opaque policies
//!
//! Samples a black-box policy over a state distribution, grows a decision
//! tree that imitates it, flattens the tree into condition→action rules and
//! serves those rules as a cheap substitute for the original policy. Usage
//! feedback keeps the rule set ranked and pruned over time.

pub mod cart;
pub mod clock;
pub mod config;
pub mod deterministic;
pub mod engine;
pub mod errors;
pub mod optimizer;
pub mod persistence;
pub mod rule;
pub mod sampler;
pub mod serialization;
pub mod store;
pub mod tree;

pub use cart::{ImpurityCriterion, TreeBuilder, TreeConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use deterministic::{seeded_rng, DistillRng, SplitTieBreaker};
pub use engine::{DistillationEngine, DistillationReport};
pub use errors::{DistillError, Result};
pub use optimizer::{OptimizeConfig, RuleOptimizer};
pub use persistence::{
    InMemoryPersistence, JsonFilePersistence, PolicyRuleSerialized, RulePersistence,
};
pub use rule::{
    ActionId, FeatureConstraint, FeatureIndex, PolicyRule, QualityWeights, RuleCondition,
    RuleId, RuleMetadata,
};
pub use sampler::{
    BehaviorAnalysis, BehaviorSampler, FeatureImportance, PolicyOracle, Sample, SamplerConfig,
    ScoringOracle, StateDistribution,
};
pub use store::{EngineStats, Prediction, PruneConfig, PruneReport, RuleStore, UsageStats};
pub use tree::{DecisionTree, TreeNode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

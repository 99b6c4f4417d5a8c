//! Engine configuration
//!
//! Every section has defaults, so a TOML file only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::cart::TreeConfig;
use crate::errors::{DistillError, Result};
use crate::optimizer::OptimizeConfig;
use crate::rule::{ActionId, QualityWeights};
use crate::sampler::SamplerConfig;
use crate::store::PruneConfig;

/// Top-level configuration of a [`crate::engine::DistillationEngine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tree induction
    pub tree: TreeConfig,
    /// Rule extraction and optimization
    pub optimize: OptimizeConfig,
    /// Pruning thresholds used by `prune()`
    pub prune: PruneConfig,
    /// Quality score weights and feedback constants
    pub quality: QualityWeights,
    /// Behavior sampling
    pub sampler: SamplerConfig,
    /// Seed of the engine's random stream
    pub seed: u64,
    /// Action returned when no rule applies
    pub default_action: ActionId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tree: TreeConfig::default(),
            optimize: OptimizeConfig::default(),
            prune: PruneConfig::default(),
            quality: QualityWeights::default(),
            sampler: SamplerConfig::default(),
            seed: 42,
            default_action: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|err| DistillError::InvalidConfig(format!("failed to parse config: {err}")))
    }

    /// Load and validate a TOML config file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| DistillError::InvalidConfig(format!("failed to encode config: {err}")))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml_string()?)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Reject invalid sections; warn about legal but suspicious combinations
    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;
        self.optimize.validate()?;
        self.prune.validate()?;
        self.quality.validate()?;
        self.sampler.validate()?;

        let mut warnings = Vec::new();
        if self.optimize.quality_threshold < self.prune.quality_threshold {
            warnings.push(format!(
                "optimize.quality_threshold {} is below prune.quality_threshold {}; fresh rules may be pruned immediately",
                self.optimize.quality_threshold, self.prune.quality_threshold
            ));
        }
        if self.tree.min_samples_split < 2 * self.tree.min_samples_leaf {
            warnings.push(format!(
                "tree.min_samples_split {} cannot produce two leaves of {} samples",
                self.tree.min_samples_split, self.tree.min_samples_leaf
            ));
        }
        if !warnings.is_empty() {
            warn!("Configuration validation warnings: {:?}", warnings);
        }
        Ok(())
    }
}

//! IPPAN Policy Distillation CLI
//!
//! Distils a synthetic threshold policy into rules and writes the rule set
//! with its BLAKE3 hash.

use anyhow::{Context, Result};
use clap::Parser;
use ippan_policy_distill::{
    ActionId, DistillationEngine, EngineConfig, JsonFilePersistence, StateDistribution,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "policy-distill")]
#[command(author = "IPPAN Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distil a policy into interpretable condition/action rules", long_about = None)]
struct Args {
    /// Number of states to sample
    #[arg(short, long, default_value = "2000")]
    samples: usize,

    /// State dimensionality
    #[arg(long, default_value = "2")]
    dim: usize,

    /// Seed of the sampling and bagging RNG (overrides the config file)
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum tree depth (overrides the config file)
    #[arg(long)]
    max_depth: Option<usize>,

    /// Rule budget after optimization (overrides the config file)
    #[arg(long)]
    max_rules: Option<usize>,

    /// TOML engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for rules and hash
    #[arg(short, long, default_value = "rules")]
    output: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Demo policy: action 1 when the first feature is above 0.5, 2 when the
/// second one is too, 0 otherwise
fn threshold_policy(state: &[f64]) -> anyhow::Result<(ActionId, Vec<f64>)> {
    let high_first = state.first().is_some_and(|&x| x > 0.5);
    let high_second = state.get(1).is_some_and(|&x| x > 0.5);
    let action = match (high_first, high_second) {
        (true, true) => 2,
        (true, false) => 1,
        _ => 0,
    };
    let mut distribution = vec![0.05; 3];
    distribution[action] = 0.9;
    Ok((action, distribution))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("IPPAN Policy Distillation v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_depth) = args.max_depth {
        config.tree.max_depth = max_depth;
    }
    if let Some(max_rules) = args.max_rules {
        config.optimize.max_rules = max_rules;
    }
    config.validate().context("Invalid configuration")?;

    info!("Distillation configuration:");
    info!("  Samples: {} over {} features", args.samples, args.dim);
    info!("  Seed: {}", config.seed);
    info!("  Max depth: {}", config.tree.max_depth);
    info!("  Max rules: {}", config.optimize.max_rules);

    let engine = DistillationEngine::new(config);
    let distribution = StateDistribution::Uniform {
        min: 0.0,
        max: 1.0,
        dim: args.dim,
    };
    let report = engine
        .distill(&threshold_policy, &distribution, args.samples)
        .context("Distillation failed")?;

    info!("Distillation complete!");
    info!("  Rules extracted: {}", report.rules_extracted);
    info!("  Rules kept: {}", report.rules_after_optimization);
    info!("  Tree depth: {}, leaves: {}", report.tree_depth, report.tree_leaves);
    info!("  Compression ratio: {:.1}", report.compression_ratio);
    info!(
        "  Estimated preservation: {:.1}%",
        report.estimated_performance_preservation * 100.0
    );
    for importance in report.feature_importance.iter().take(5) {
        info!(
            "  Feature {}: importance={:.4}, disagreement={:.3}",
            importance.feature, importance.importance, importance.disagreement_rate
        );
    }

    let persistence = JsonFilePersistence::new(args.output.join("rules.json"));
    let saved = engine
        .checkpoint(&persistence)
        .context("Failed to write rule set")?;

    let stats = engine.stats();
    info!("✓ Distillation completed successfully");
    info!("  Rules: {} ({} saved)", persistence.path().display(), saved);
    info!("  Hash: {}", persistence.hash_path().display());
    info!("  Average quality: {:.3}", stats.avg_quality);

    Ok(())
}

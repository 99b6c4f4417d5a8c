//! Rule persistence collaborators
//!
//! The engine itself never touches disk. A [`RulePersistence`] implementation
//! is handed to `load_from`/`checkpoint` explicitly, outside any store lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{DistillError, Result};
use crate::rule::{ActionId, PolicyRule, RuleCondition, RuleId, RuleMetadata};
use crate::serialization::{blake3_hex, decode_rule_set, encode_rule_set};
use crate::store::UsageStats;

/// Current version of [`PolicyRuleSerialized`]
pub const RULE_RECORD_VERSION: u32 = 1;

/// Stable, versioned record of a rule and its usage statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRuleSerialized {
    pub version: u32,
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
    #[serde(default)]
    pub total_performance: f64,
    /// When the rule entered the store it was saved from
    #[serde(default)]
    pub inserted_at: Option<DateTime<Utc>>,
}

impl PolicyRuleSerialized {
    pub fn from_rule(rule: &PolicyRule, usage: Option<&UsageStats>) -> Self {
        Self {
            version: RULE_RECORD_VERSION,
            id: rule.id,
            condition: rule.condition.clone(),
            action: rule.action,
            confidence: rule.confidence,
            support: rule.support,
            performance: rule.performance,
            created_at: rule.created_at,
            last_used_at: rule.last_used_at,
            usage_count: rule.usage_count,
            metadata: rule.metadata,
            total_performance: usage.map_or(0.0, |u| u.total_performance),
            inserted_at: usage.map(|u| u.created),
        }
    }

    /// Validate and convert back into a rule with its usage statistics
    pub fn into_entry(self) -> Result<(PolicyRule, UsageStats)> {
        if self.version != RULE_RECORD_VERSION {
            return Err(DistillError::Persistence(format!(
                "rule {} has unsupported record version {}",
                self.id, self.version
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.performance.is_finite() {
            return Err(DistillError::Persistence(format!(
                "rule {} has out-of-range confidence or performance",
                self.id
            )));
        }
        // Re-run constraint validation; the record may have been edited by hand
        let condition = RuleCondition::from_constraints(
            self.condition.iter().map(|(&feature, constraint)| (feature, *constraint)),
        )
        .map_err(|err| DistillError::Persistence(format!("rule {}: {err}", self.id)))?;

        let usage = UsageStats {
            times_used: self.usage_count,
            total_performance: self.total_performance,
            last_used: self.last_used_at,
            created: self.inserted_at.unwrap_or(self.created_at),
        };
        let rule = PolicyRule {
            id: self.id,
            condition,
            action: self.action,
            confidence: self.confidence,
            support: self.support,
            performance: self.performance,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
            metadata: self.metadata,
        };
        Ok((rule, usage))
    }
}

/// Storage collaborator for rule sets
pub trait RulePersistence: Send + Sync {
    fn save(&self, rules: &[PolicyRuleSerialized]) -> Result<()>;
    fn load(&self) -> Result<Vec<PolicyRuleSerialized>>;
}

/// Canonical-JSON rule file with a BLAKE3 sidecar (`<name>.hash`)
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_path(&self) -> PathBuf {
        self.path.with_extension("hash")
    }
}

fn persistence_err(context: &str, err: impl std::fmt::Display) -> DistillError {
    DistillError::Persistence(format!("{context}: {err}"))
}

impl RulePersistence for JsonFilePersistence {
    fn save(&self, rules: &[PolicyRuleSerialized]) -> Result<()> {
        let (json, hash) = encode_rule_set(rules)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| persistence_err("failed to create rule directory", err))?;
        }

        // Write then rename so a crash never leaves a torn rule file
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, &json)
            .map_err(|err| persistence_err("failed to write rule file", err))?;
        std::fs::rename(&staging, &self.path)
            .map_err(|err| persistence_err("failed to move rule file into place", err))?;

        std::fs::write(self.hash_path(), &hash)
            .map_err(|err| persistence_err("failed to write hash file", err))?;

        info!(path = %self.path.display(), rules = rules.len(), %hash, "rule set saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<PolicyRuleSerialized>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no rule file yet");
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&self.path)
            .map_err(|err| persistence_err("failed to read rule file", err))?;

        let hash_path = self.hash_path();
        if hash_path.exists() {
            let expected = std::fs::read_to_string(&hash_path)
                .map_err(|err| persistence_err("failed to read hash file", err))?;
            let actual = blake3_hex(json.as_bytes());
            if expected.trim() != actual {
                return Err(DistillError::Persistence(format!(
                    "rule file hash mismatch: expected {}, got {actual}",
                    expected.trim()
                )));
            }
        }

        let rules = decode_rule_set(&json)?;
        info!(path = %self.path.display(), rules = rules.len(), "rule set loaded");
        Ok(rules)
    }
}

/// Process-local persistence, mainly for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    records: Mutex<Vec<PolicyRuleSerialized>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RulePersistence for InMemoryPersistence {
    fn save(&self, rules: &[PolicyRuleSerialized]) -> Result<()> {
        *self.records.lock() = rules.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<PolicyRuleSerialized>> {
        Ok(self.records.lock().clone())
    }
}

//! Canonical rule-set encoding
//!
//! A rule set is written as pretty JSON with every object's keys sorted, so
//! equal rule sets always produce the same bytes and the same BLAKE3 digest.

use serde::{Deserialize, Serialize};
use serde_json::{ser::PrettyFormatter, Serializer, Value};

use crate::errors::{DistillError, Result};
use crate::persistence::{PolicyRuleSerialized, RULE_RECORD_VERSION};

/// Envelope around the persisted records
#[derive(Debug, Serialize, Deserialize)]
struct RuleSetFile {
    format_version: u32,
    rules: Vec<PolicyRuleSerialized>,
}

/// Sort object keys in place, at every depth
fn sort_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, mut child) in entries {
                sort_keys(&mut child);
                map.insert(key, child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sort_keys),
        _ => {}
    }
}

/// Canonical JSON text of any serializable value
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let mut tree = serde_json::to_value(value)?;
    sort_keys(&mut tree);

    let mut out = Vec::new();
    {
        let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"  "));
        tree.serialize(&mut serializer)?;
    }
    String::from_utf8(out)
        .map_err(|err| DistillError::Persistence(format!("canonical JSON is not UTF-8: {err}")))
}

/// BLAKE3 digest of `bytes`, hex encoded
pub fn blake3_hex(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Canonical text of a rule set together with its digest
pub fn encode_rule_set(rules: &[PolicyRuleSerialized]) -> Result<(String, String)> {
    let json = canonical_json(&RuleSetFile {
        format_version: RULE_RECORD_VERSION,
        rules: rules.to_vec(),
    })?;
    let hash = blake3_hex(json.as_bytes());
    Ok((json, hash))
}

/// Parse a rule set written by [`encode_rule_set`]
pub fn decode_rule_set(json: &str) -> Result<Vec<PolicyRuleSerialized>> {
    let file: RuleSetFile = serde_json::from_str(json)?;
    if file.format_version != RULE_RECORD_VERSION {
        return Err(DistillError::Persistence(format!(
            "unsupported rule file version {}",
            file.format_version
        )));
    }
    Ok(file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_depth() {
        let out = canonical_json(&json!({"b": 1, "a": {"z": true, "c": [ {"y": 1, "x": 2} ]}})).unwrap();

        let pos = |key: &str| out.find(&format!("\"{key}\"")).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("c") < pos("z"));
        assert!(pos("x") < pos("y"));
    }

    #[test]
    fn equal_rule_sets_hash_equally() {
        let (json_a, hash_a) = encode_rule_set(&[]).unwrap();
        let (json_b, hash_b) = encode_rule_set(&[]).unwrap();
        assert_eq!(json_a, json_b);
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);
        assert!(decode_rule_set(&json_a).unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(matches!(
            decode_rule_set("{ not json"),
            Err(DistillError::Serialization(_))
        ));
        assert!(matches!(
            decode_rule_set(r#"{"format_version": 7, "rules": []}"#),
            Err(DistillError::Persistence(_))
        ));
    }
}

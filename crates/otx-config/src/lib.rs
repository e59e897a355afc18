//! otx-config
//!
//! Layered configuration for the AlienVault OTX connector:
//! - YAML layers deep-merged in order (later overrides earlier) into a JSON tree,
//!   hashed canonically so every run can log which config it used;
//! - a typed setting table ([`schema`]) resolved env > file > default by
//!   [`ConfigResolver`];
//! - the immutable [`ConfigSnapshot`] built once at startup;
//! - an unknown-key report for the connector-owned YAML sections.

pub mod duration;
pub mod error;
pub mod resolver;
pub mod schema;
pub mod snapshot;

pub use duration::IsoDuration;
pub use error::ConfigError;
pub use resolver::{ConfigResolver, RawValue};
pub use snapshot::{
    AlienVaultSettings, Cadence, ConfigSnapshot, ConnectorSettings, ReportStatus, TlpMarking,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

// ---------------------------------------------------------------------------
// Layered loading + hashing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// No file layers at all (the default config file is absent).
    pub fn empty() -> Self {
        // "{}" is always a valid single document.
        let merged = serde_json::json!({});
        let canonical_json = merged.to_string();
        Self {
            config_hash: sha256_hex(canonical_json.as_bytes()),
            canonical_json,
            config_json: merged,
        }
    }
}

pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig, ConfigError> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let p = p.as_ref();
        let raw = fs::read_to_string(p).map_err(|e| ConfigError::Io {
            path: p.display().to_string(),
            reason: e.to_string(),
        })?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig, ConfigError> {
    // Earlier docs are base, later docs override.
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        let v_json =
            serde_json::to_value(v_yaml).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        // An empty document contributes nothing.
        if v_json.is_null() {
            continue;
        }
        if !v_json.is_object() {
            return Err(ConfigError::Yaml(
                "top-level config document must be a mapping".to_string(),
            ));
        }
        merged = deep_merge(merged, v_json);
    }

    // serde_json::Map is BTreeMap-backed here, so key order is canonical.
    let canonical_json = merged.to_string();
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Unknown-key report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownKeyReport {
    /// Leaf pointers under connector-owned sections that no setting consumes (sorted).
    pub unknown_leaf_pointers: Vec<String>,
}

impl UnknownKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unknown_leaf_pointers.is_empty()
    }
}

/// Report YAML leaves under `connector.*` / `alienvault.*` that the setting
/// table does not declare (typos such as `alienvault.intervall_sec`).
pub fn report_unknown_keys(
    config_json: &Value,
    policy: UnknownKeyPolicy,
) -> Result<UnknownKeyReport, ConfigError> {
    let consumed: BTreeSet<String> = schema::SETTINGS.iter().map(|s| s.pointer()).collect();

    let mut leaves: Vec<String> = Vec::new();
    collect_leaf_pointers(config_json, "", &mut leaves);

    let mut unknown: Vec<String> = leaves
        .into_iter()
        .filter(|lp| {
            schema::OWNED_SECTIONS
                .iter()
                .any(|sec| is_prefix_pointer(sec, lp))
        })
        .filter(|lp| !consumed.iter().any(|cp| is_prefix_pointer(cp, lp)))
        .collect();
    unknown.sort();
    unknown.dedup();

    let report = UnknownKeyReport {
        unknown_leaf_pointers: unknown,
    };

    if policy == UnknownKeyPolicy::Fail && !report.is_clean() {
        return Err(ConfigError::UnknownKeys {
            count: report.unknown_leaf_pointers.len(),
            preview: preview_list(&report.unknown_leaf_pointers, 12),
        });
    }

    Ok(report)
}

/// `prefix` is a JSON-pointer prefix of `leaf`: "/a/b" covers "/a/b" and
/// "/a/b/c" but not "/a/bc".
fn is_prefix_pointer(prefix: &str, leaf: &str) -> bool {
    if prefix == "/" || leaf == prefix {
        return true;
    }
    leaf.starts_with(prefix)
        && leaf
            .get(prefix.len()..prefix.len() + 1)
            .map(|c| c == "/")
            .unwrap_or(false)
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn preview_list(items: &[String], n: usize) -> String {
    let take = items.iter().take(n).cloned().collect::<Vec<_>>();
    format!("{:?}", take)
}

//! Typed setting table.
//!
//! Every setting the connector reads is declared here exactly once: its
//! dotted key, value kind and default. The resolver consults this table; no
//! other module spells a config key as a string literal.
//!
//! Key derivation:
//! - env var:      `alienvault.base_url` -> `ALIENVAULT_BASE_URL`
//! - YAML pointer: `alienvault.base_url` -> `/alienvault/base_url`

/// Value kind of a setting. Drives coercion and validation in the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Text,
    Number,
    Bool,
    /// Comma-separated list (or YAML sequence) decoded to a set of tokens.
    List,
    /// Case-insensitive token from a fixed set.
    Enum(&'static [&'static str]),
    /// ISO-8601 duration (`PnYnMnWnDTnHnMnS`).
    Duration,
    /// RFC 3339 / naive ISO timestamp / epoch seconds.
    Timestamp,
    /// `host:port` socket address.
    SocketAddr,
}

/// What happens when neither the environment nor the file provides a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingDefault {
    /// Startup fails with `ConfigError::Missing`.
    Required,
    /// The setting is optional; absence is meaningful (e.g. selects a mode).
    Unset,
    Bool(bool),
    Number(i64),
    Text(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub key: &'static str,
    pub kind: SettingKind,
    pub default: SettingDefault,
}

impl Setting {
    const fn new(key: &'static str, kind: SettingKind, default: SettingDefault) -> Self {
        Self { key, kind, default }
    }

    /// Upper-cased, underscore-joined environment variable name.
    pub fn env_var(&self) -> String {
        self.key.replace('.', "_").to_ascii_uppercase()
    }

    /// JSON pointer into the merged YAML tree.
    pub fn pointer(&self) -> String {
        format!("/{}", self.key.replace('.', "/"))
    }
}

pub const TLP_TOKENS: &[&str] = &["white", "clear", "green", "amber", "amber+strict", "red"];
pub const REPORT_STATUS_TOKENS: &[&str] = &["new", "in progress", "analyzed", "closed"];

use SettingDefault as D;
use SettingKind as K;

// connector.*
pub const CONNECTOR_ID: Setting = Setting::new("connector.id", K::Text, D::Text("alienvault"));
pub const CONNECTOR_NAME: Setting =
    Setting::new("connector.name", K::Text, D::Text("AlienVault"));
pub const LOG_LEVEL: Setting = Setting::new("connector.log_level", K::Text, D::Text("info"));
pub const DURATION_PERIOD: Setting =
    Setting::new("connector.duration_period", K::Duration, D::Unset);
pub const RUN_AND_TERMINATE: Setting =
    Setting::new("connector.run_and_terminate", K::Bool, D::Bool(false));
pub const CYCLE_TIMEOUT_SEC: Setting =
    Setting::new("connector.cycle_timeout_sec", K::Number, D::Unset);
pub const STATE_PATH: Setting = Setting::new(
    "connector.state_path",
    K::Text,
    D::Text("state/checkpoint.json"),
);
pub const WORK_LOG_PATH: Setting =
    Setting::new("connector.work_log_path", K::Text, D::Text("state/work.jsonl"));
pub const BUNDLE_DIR: Setting =
    Setting::new("connector.bundle_dir", K::Text, D::Text("state/bundles"));
pub const STATUS_ADDR: Setting = Setting::new("connector.status_addr", K::SocketAddr, D::Unset);

// alienvault.*
pub const INTERVAL_SEC: Setting =
    Setting::new("alienvault.interval_sec", K::Number, D::Number(1800));
pub const BASE_URL: Setting = Setting::new("alienvault.base_url", K::Text, D::Required);
pub const API_KEY: Setting = Setting::new("alienvault.api_key", K::Text, D::Required);
pub const TLP: Setting = Setting::new("alienvault.tlp", K::Enum(TLP_TOKENS), D::Text("white"));
pub const CREATE_OBSERVABLES: Setting =
    Setting::new("alienvault.create_observables", K::Bool, D::Bool(true));
pub const CREATE_INDICATORS: Setting =
    Setting::new("alienvault.create_indicators", K::Bool, D::Bool(true));
pub const FILTER_INDICATORS: Setting =
    Setting::new("alienvault.filter_indicators", K::Bool, D::Bool(true));
pub const PULSE_START_TIMESTAMP: Setting =
    Setting::new("alienvault.pulse_start_timestamp", K::Timestamp, D::Unset);
pub const REPORT_STATUS: Setting = Setting::new(
    "alienvault.report_status",
    K::Enum(REPORT_STATUS_TOKENS),
    D::Required,
);
pub const REPORT_TYPE: Setting =
    Setting::new("alienvault.report_type", K::Text, D::Text("threat-report"));
pub const GUESS_MALWARE: Setting =
    Setting::new("alienvault.guess_malware", K::Bool, D::Bool(false));
pub const GUESS_CVE: Setting = Setting::new("alienvault.guess_cve", K::Bool, D::Bool(false));
pub const EXCLUDED_PULSE_INDICATOR_TYPES: Setting = Setting::new(
    "alienvault.excluded_pulse_indicator_types",
    K::List,
    D::Unset,
);
pub const ENABLE_RELATIONSHIPS: Setting =
    Setting::new("alienvault.enable_relationships", K::Bool, D::Bool(true));
pub const ENABLE_ATTACK_PATTERNS_INDICATES: Setting = Setting::new(
    "alienvault.enable_attack_patterns_indicates",
    K::Bool,
    D::Bool(true),
);

/// Every known setting. Also serves as the consumed-key registry for the
/// unknown-key report.
pub const SETTINGS: &[Setting] = &[
    CONNECTOR_ID,
    CONNECTOR_NAME,
    LOG_LEVEL,
    DURATION_PERIOD,
    RUN_AND_TERMINATE,
    CYCLE_TIMEOUT_SEC,
    STATE_PATH,
    WORK_LOG_PATH,
    BUNDLE_DIR,
    STATUS_ADDR,
    INTERVAL_SEC,
    BASE_URL,
    API_KEY,
    TLP,
    CREATE_OBSERVABLES,
    CREATE_INDICATORS,
    FILTER_INDICATORS,
    PULSE_START_TIMESTAMP,
    REPORT_STATUS,
    REPORT_TYPE,
    GUESS_MALWARE,
    GUESS_CVE,
    EXCLUDED_PULSE_INDICATOR_TYPES,
    ENABLE_RELATIONSHIPS,
    ENABLE_ATTACK_PATTERNS_INDICATES,
];

/// Top-level YAML sections owned by this connector. Keys outside these
/// sections (e.g. `opencti.*`) belong to the platform and are not checked.
pub const OWNED_SECTIONS: &[&str] = &["/connector", "/alienvault"];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn env_var_is_upper_snake_of_key() {
        assert_eq!(BASE_URL.env_var(), "ALIENVAULT_BASE_URL");
        assert_eq!(DURATION_PERIOD.env_var(), "CONNECTOR_DURATION_PERIOD");
        assert_eq!(
            ENABLE_ATTACK_PATTERNS_INDICATES.env_var(),
            "ALIENVAULT_ENABLE_ATTACK_PATTERNS_INDICATES"
        );
    }

    #[test]
    fn pointer_follows_dotted_path() {
        assert_eq!(INTERVAL_SEC.pointer(), "/alienvault/interval_sec");
        assert_eq!(STATE_PATH.pointer(), "/connector/state_path");
    }

    #[test]
    fn keys_are_unique_and_namespaced() {
        let mut seen = BTreeSet::new();
        for s in SETTINGS {
            assert!(seen.insert(s.key), "duplicate key {}", s.key);
            assert!(
                OWNED_SECTIONS.iter().any(|sec| s.pointer().starts_with(sec)),
                "{} outside owned sections",
                s.key
            );
        }
    }
}

//! Scenario: snapshot resolution across env, YAML layers and defaults
//!
//! Covers:
//! 1. Defaults when only the required settings are present.
//! 2. Env overrides YAML, later YAML layers override earlier ones.
//! 3. Duration period takes precedence over interval; non-positive interval
//!    falls back to 1800s.
//! 4. Missing endpoint / credential fail before anything else.
//! 5. Invalid duration, TLP and timestamp are fatal.
//! 6. Debug output never contains the API key.
//! 7. Config hash is stable under key reordering.
//! 8. Unknown connector keys are reported, platform keys are not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use otx_config::{
    load_layered_yaml_from_strings, report_unknown_keys, Cadence, ConfigError, ConfigResolver,
    ConfigSnapshot, ReportStatus, TlpMarking, UnknownKeyPolicy,
};

const MINIMAL_YAML: &str = r#"
alienvault:
  base_url: "https://otx.alienvault.com"
  api_key: "secret-value-do-not-print"
  report_status: "New"
"#;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn resolve(docs: &[&str], env: &HashMap<String, String>) -> Result<ConfigSnapshot, ConfigError> {
    let loaded = load_layered_yaml_from_strings(docs).expect("yaml parses");
    let resolver = ConfigResolver::from_map(&loaded.config_json, env);
    ConfigSnapshot::resolve(&resolver)
}

// ---------------------------------------------------------------------------
// 1. Defaults
// ---------------------------------------------------------------------------

#[test]
fn defaults_apply_when_only_required_settings_present() {
    let snap = resolve(&[MINIMAL_YAML], &env(&[])).unwrap();
    let av = &snap.alienvault;

    assert_eq!(av.tlp, TlpMarking::White);
    assert!(av.create_observables);
    assert!(av.create_indicators);
    assert!(av.filter_indicators);
    assert!(av.enable_relationships);
    assert!(av.enable_attack_patterns_indicates);
    assert!(!av.guess_malware);
    assert!(!av.guess_cve);
    assert_eq!(av.report_status, ReportStatus::New);
    assert_eq!(av.report_type, "threat-report");
    assert!(av.excluded_pulse_indicator_types.is_empty());
    assert!(av.pulse_start_timestamp.is_none());

    assert_eq!(snap.cadence, Cadence::Interval(Duration::from_secs(1800)));

    let c = &snap.connector;
    assert_eq!(c.id, "alienvault");
    assert_eq!(c.name, "AlienVault");
    assert!(!c.run_and_terminate);
    assert!(c.cycle_timeout.is_none());
    assert_eq!(c.state_path, PathBuf::from("state/checkpoint.json"));
    assert!(c.status_addr.is_none());
}

// ---------------------------------------------------------------------------
// 2. Precedence
// ---------------------------------------------------------------------------

#[test]
fn env_beats_yaml_and_later_layers_beat_earlier() {
    let overlay = r#"
alienvault:
  tlp: "amber"
  report_type: "malware"
  create_observables: false
"#;
    let e = env(&[
        ("ALIENVAULT_TLP", "Red"),
        ("ALIENVAULT_EXCLUDED_PULSE_INDICATOR_TYPES", "FileHash-MD5, FileHash-SHA1"),
    ]);
    let snap = resolve(&[MINIMAL_YAML, overlay], &e).unwrap();

    assert_eq!(snap.alienvault.tlp, TlpMarking::Red);
    assert_eq!(snap.alienvault.report_type, "malware");
    assert!(!snap.alienvault.create_observables);
    assert!(snap
        .alienvault
        .excluded_pulse_indicator_types
        .contains("FileHash-SHA1"));
}

// ---------------------------------------------------------------------------
// 3. Cadence
// ---------------------------------------------------------------------------

#[test]
fn duration_period_takes_precedence_over_interval() {
    let e = env(&[
        ("CONNECTOR_DURATION_PERIOD", "PT5M"),
        ("ALIENVAULT_INTERVAL_SEC", "60"),
    ]);
    let snap = resolve(&[MINIMAL_YAML], &e).unwrap();
    match snap.cadence {
        Cadence::Period(d) => assert_eq!(d.minutes, 5),
        other => panic!("expected duration mode, got {other:?}"),
    }
}

#[test]
fn explicit_interval_is_used_without_duration() {
    let e = env(&[("ALIENVAULT_INTERVAL_SEC", "60")]);
    let snap = resolve(&[MINIMAL_YAML], &e).unwrap();
    assert_eq!(snap.cadence, Cadence::Interval(Duration::from_secs(60)));
}

#[test]
fn non_positive_interval_falls_back_to_default() {
    for v in ["0", "-5"] {
        let e = env(&[("ALIENVAULT_INTERVAL_SEC", v)]);
        let snap = resolve(&[MINIMAL_YAML], &e).unwrap();
        assert_eq!(snap.cadence, Cadence::Interval(Duration::from_secs(1800)), "{v}");
    }
}

// ---------------------------------------------------------------------------
// 4. Required settings
// ---------------------------------------------------------------------------

#[test]
fn missing_base_url_or_api_key_is_fatal() {
    let no_url = r#"
alienvault:
  api_key: "k"
  report_status: "new"
"#;
    let err = resolve(&[no_url], &env(&[])).unwrap_err();
    assert!(matches!(err, ConfigError::Missing { key: "alienvault.base_url", .. }));

    let no_key = r#"
alienvault:
  base_url: "https://otx.alienvault.com"
  report_status: "new"
"#;
    let err = resolve(&[no_key], &env(&[])).unwrap_err();
    assert!(matches!(err, ConfigError::Missing { key: "alienvault.api_key", .. }));
    assert!(err.to_string().contains("ALIENVAULT_API_KEY"));
}

// ---------------------------------------------------------------------------
// 5. Invalid values
// ---------------------------------------------------------------------------

#[test]
fn invalid_values_are_fatal() {
    let cases: &[(&str, &str)] = &[
        ("CONNECTOR_DURATION_PERIOD", "every hour"),
        ("ALIENVAULT_TLP", "purple"),
        ("ALIENVAULT_PULSE_START_TIMESTAMP", "last tuesday"),
        ("ALIENVAULT_INTERVAL_SEC", "ten"),
        ("CONNECTOR_STATUS_ADDR", "not-an-addr"),
    ];
    for (var, value) in cases {
        let e = env(&[(*var, *value)]);
        assert!(
            resolve(&[MINIMAL_YAML], &e).is_err(),
            "{var}={value} must be rejected"
        );
    }
}

// ---------------------------------------------------------------------------
// 6. Redaction
// ---------------------------------------------------------------------------

#[test]
fn debug_output_redacts_api_key() {
    let snap = resolve(&[MINIMAL_YAML], &env(&[])).unwrap();
    let dbg = format!("{snap:?}");
    assert!(!dbg.contains("secret-value-do-not-print"), "{dbg}");
    assert!(dbg.contains("<REDACTED>"));
}

// ---------------------------------------------------------------------------
// 7. Hash stability
// ---------------------------------------------------------------------------

#[test]
fn config_hash_ignores_key_order() {
    let reordered = r#"
alienvault:
  report_status: "New"
  api_key: "secret-value-do-not-print"
  base_url: "https://otx.alienvault.com"
"#;
    let a = load_layered_yaml_from_strings(&[MINIMAL_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[reordered]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.config_hash.len(), 64);

    let c = load_layered_yaml_from_strings(&[MINIMAL_YAML, "alienvault:\n  tlp: red\n"]).unwrap();
    assert_ne!(a.config_hash, c.config_hash);
}

// ---------------------------------------------------------------------------
// 8. Unknown keys
// ---------------------------------------------------------------------------

#[test]
fn unknown_connector_keys_are_reported() {
    let yaml = r#"
opencti:
  url: "http://localhost:8080"
  token: "whatever"
connector:
  duration_period: "PT1H"
  nmae: "typo"
alienvault:
  base_url: "https://otx.alienvault.com"
  intervall_sec: 10
  excluded_pulse_indicator_types: ["URL", "email"]
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();

    let report = report_unknown_keys(&loaded.config_json, UnknownKeyPolicy::Warn).unwrap();
    assert_eq!(
        report.unknown_leaf_pointers,
        vec![
            "/alienvault/intervall_sec".to_string(),
            "/connector/nmae".to_string()
        ]
    );

    let err = report_unknown_keys(&loaded.config_json, UnknownKeyPolicy::Fail).unwrap_err();
    assert!(err.to_string().contains("CONFIG_UNKNOWN_KEYS"));
}

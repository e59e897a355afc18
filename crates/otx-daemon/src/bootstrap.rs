//! Startup wiring: config layers -> snapshot -> scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use otx_audit::WorkLog;
use otx_checkpoint::JsonFileCheckpointStore;
use otx_config::{
    load_layered_yaml, report_unknown_keys, ConfigResolver, ConfigSnapshot, LoadedConfig,
    UnknownKeyPolicy, UnknownKeyReport,
};
use otx_feed::OtxClient;
use otx_import::{AuthorIdentity, BundleOptions, DirectoryBundleSink, PulseImporter};
use otx_runtime::{ConnectorIdentity, RunCycle, RunScheduler};

/// Used when no `--config` is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug)]
pub struct Bootstrapped {
    pub loaded: LoadedConfig,
    pub snapshot: ConfigSnapshot,
    pub unknown: UnknownKeyReport,
}

/// Explicit layers win; otherwise `config.yml` in the working dir if present.
pub fn config_layers(explicit: &[PathBuf]) -> Vec<PathBuf> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    if default.is_file() {
        vec![default.to_path_buf()]
    } else {
        Vec::new()
    }
}

/// Load YAML layers and resolve the snapshot against `env`.
pub fn load(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> Result<Bootstrapped> {
    let layers = config_layers(paths);
    let loaded = if layers.is_empty() {
        LoadedConfig::empty()
    } else {
        load_layered_yaml(&layers)?
    };

    let snapshot = {
        let resolver = ConfigResolver::new(&loaded.config_json, env);
        ConfigSnapshot::resolve(&resolver)?
    };
    let unknown = report_unknown_keys(&loaded.config_json, UnknownKeyPolicy::Warn)?;

    Ok(Bootstrapped {
        loaded,
        snapshot,
        unknown,
    })
}

/// Build the production scheduler: OTX client, directory sink, file-backed
/// checkpoint store and hash-chained work log.
pub fn build_scheduler(snapshot: &ConfigSnapshot, run_once: bool) -> Result<RunScheduler> {
    let c = &snapshot.connector;
    let av = &snapshot.alienvault;

    let client = OtxClient::new(av.base_url.clone(), av.api_key.clone())?;
    let sink = DirectoryBundleSink::new(&c.bundle_dir);
    let importer = PulseImporter::new(
        Arc::new(client),
        Arc::new(sink),
        Arc::new(AuthorIdentity::alienvault(Utc::now())),
        BundleOptions::from(av),
    )
    .with_start_timestamp(av.pulse_start_timestamp);

    let work_log = WorkLog::open(&c.work_log_path, c.id.clone(), true)
        .with_context(|| format!("open work log {:?}", c.work_log_path))?;
    let store = JsonFileCheckpointStore::new(&c.state_path);

    let cycle = RunCycle::new(
        ConnectorIdentity::new(c.id.clone(), c.name.clone()),
        Arc::new(store),
        Arc::new(work_log),
        Arc::new(importer),
    )
    .with_import_timeout(c.cycle_timeout);

    Ok(RunScheduler::new(cycle, snapshot.cadence).run_once(run_once || c.run_and_terminate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    const CREDS: &[(&str, &str)] = &[
        ("ALIENVAULT_BASE_URL", "https://otx.example"),
        ("ALIENVAULT_API_KEY", "k"),
        ("ALIENVAULT_REPORT_STATUS", "new"),
    ];

    #[test]
    fn explicit_layers_merge_and_report_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yml");
        let over = dir.path().join("over.yml");
        std::fs::write(&base, "alienvault:\n  interval_sec: 60\n  intervall_sec: 5\n").unwrap();
        std::fs::write(&over, "alienvault:\n  interval_sec: 120\n").unwrap();

        let b = load(&[base, over], env(CREDS)).unwrap();
        assert_eq!(b.snapshot.cadence.to_string(), "interval 120s");
        assert_eq!(
            b.unknown.unknown_leaf_pointers,
            vec!["/alienvault/intervall_sec".to_string()]
        );
    }

    #[test]
    fn missing_credentials_fail() {
        let err = load(&[], env(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("CONFIG_MISSING"), "{err:#}");
    }

    #[test]
    fn scheduler_builds_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let work_log = dir.path().join("work.jsonl");
        let mut pairs = CREDS.to_vec();
        let wl = work_log.display().to_string();
        pairs.push(("CONNECTOR_WORK_LOG_PATH", wl.as_str()));

        let b = load(&[], env(&pairs)).unwrap();
        let sched = build_scheduler(&b.snapshot, true).unwrap();
        assert_eq!(sched.cycle().connector().id, b.snapshot.connector.id);
        assert!(work_log.parent().unwrap().exists());
    }
}

//! otx-testkit
//!
//! Shared fakes for run-cycle scenarios. Each fake records what the core
//! asked of it so tests can assert call counts and payloads, and can be told
//! to fail at a specific step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use otx_audit::{AuditUnitId, AuditUnitTracker};
use otx_checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore};
use otx_feed::{Pulse, PulseSource};
use otx_runtime::{ConnectorIdentity, ImportDelegate, RunCycle};
use serde_json::Value;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a checkpoint from a JSON object literal. Panics on non-objects.
pub fn checkpoint(v: Value) -> Checkpoint {
    match Checkpoint::from_json(v) {
        Ok(cp) => cp,
        Err(e) => panic!("test checkpoint must be a JSON object: {e:#}"),
    }
}

// ---------------------------------------------------------------------------
// RecordingTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerCalls {
    pub opened: Vec<String>,
    pub closed: Vec<(AuditUnitId, String)>,
    pub errors: Vec<(AuditUnitId, String)>,
}

#[derive(Debug, Default)]
pub struct RecordingTracker {
    calls: Mutex<TrackerCalls>,
    fail_open: AtomicBool,
    fail_close: AtomicBool,
    fail_report: AtomicBool,
}

impl RecordingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_open(&self, yes: bool) {
        self.fail_open.store(yes, Ordering::SeqCst);
    }

    pub fn fail_close(&self, yes: bool) {
        self.fail_close.store(yes, Ordering::SeqCst);
    }

    pub fn fail_report(&self, yes: bool) {
        self.fail_report.store(yes, Ordering::SeqCst);
    }

    pub fn calls(&self) -> TrackerCalls {
        lock(&self.calls).clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.calls).opened.len()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.calls).closed.len()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.calls).errors.len()
    }
}

#[async_trait::async_trait]
impl AuditUnitTracker for RecordingTracker {
    async fn open(&self, label: &str) -> Result<AuditUnitId> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("platform refused to initiate work");
        }
        let mut calls = lock(&self.calls);
        calls.opened.push(label.to_string());
        Ok(AuditUnitId::new(format!("work_{}", calls.opened.len())))
    }

    async fn close(&self, unit: &AuditUnitId, summary: &str) -> Result<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            bail!("platform refused to complete work");
        }
        lock(&self.calls)
            .closed
            .push((unit.clone(), summary.to_string()));
        Ok(())
    }

    async fn report_error(&self, unit: &AuditUnitId, message: &str) -> Result<()> {
        // Recorded even when told to fail, so tests can see the attempt.
        lock(&self.calls)
            .errors
            .push((unit.clone(), message.to_string()));
        if self.fail_report.load(Ordering::SeqCst) {
            bail!("platform refused error report");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDelegate
// ---------------------------------------------------------------------------

/// Plays back one scripted result per call; an exhausted script returns an
/// empty partial. Records the checkpoint and unit of every call.
#[derive(Debug, Default)]
pub struct ScriptedDelegate {
    script: Mutex<VecDeque<std::result::Result<Checkpoint, String>>>,
    seen: Mutex<Vec<(Checkpoint, AuditUnitId)>>,
}

impl ScriptedDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn then_ok(&self, partial: Checkpoint) -> &Self {
        lock(&self.script).push_back(Ok(partial));
        self
    }

    pub fn then_err(&self, message: &str) -> &Self {
        lock(&self.script).push_back(Err(message.to_string()));
        self
    }

    pub fn seen(&self) -> Vec<(Checkpoint, AuditUnitId)> {
        lock(&self.seen).clone()
    }
}

#[async_trait::async_trait]
impl ImportDelegate for ScriptedDelegate {
    async fn import(&self, checkpoint: &Checkpoint, unit: &AuditUnitId) -> Result<Checkpoint> {
        lock(&self.seen).push((checkpoint.clone(), unit.clone()));
        let next = lock(&self.script).pop_front();
        match next {
            None => Ok(Checkpoint::new()),
            Some(Ok(partial)) => Ok(partial),
            Some(Err(msg)) => Err(anyhow!(msg)),
        }
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Memory store that can be told to fail loads or stores.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryCheckpointStore,
    fail_load: AtomicBool,
    fail_store: AtomicBool,
}

impl FailingStore {
    pub fn with_checkpoint(cp: Checkpoint) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCheckpointStore::with_checkpoint(cp),
            ..Default::default()
        })
    }

    pub fn fail_load(&self, yes: bool) {
        self.fail_load.store(yes, Ordering::SeqCst);
    }

    pub fn fail_store(&self, yes: bool) {
        self.fail_store.store(yes, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.inner.current()
    }

    pub fn writes(&self) -> u64 {
        self.inner.writes()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FailingStore {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        if self.fail_load.load(Ordering::SeqCst) {
            bail!("state backend unavailable");
        }
        self.inner.load().await
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.fail_store.load(Ordering::SeqCst) {
            bail!("state backend rejected write");
        }
        self.inner.store(checkpoint).await
    }
}

// ---------------------------------------------------------------------------
// StaticPulseSource
// ---------------------------------------------------------------------------

/// Serves a fixed pulse list, filtered to `modified >= since` the way the
/// upstream's inclusive `modified_since` does.
#[derive(Debug, Default)]
pub struct StaticPulseSource {
    pulses: Mutex<Vec<Pulse>>,
    fail: AtomicBool,
}

impl StaticPulseSource {
    pub fn new(pulses: Vec<Pulse>) -> Arc<Self> {
        Arc::new(Self {
            pulses: Mutex::new(pulses),
            fail: AtomicBool::new(false),
        })
    }

    pub fn push(&self, pulse: Pulse) {
        lock(&self.pulses).push(pulse);
    }

    pub fn fail(&self, yes: bool) {
        self.fail.store(yes, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PulseSource for StaticPulseSource {
    fn source_name(&self) -> &'static str {
        "static"
    }

    async fn fetch_pulses_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Pulse>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("otx http error status=503 body=");
        }
        Ok(lock(&self.pulses)
            .iter()
            .filter(|p| p.modified >= since)
            .cloned()
            .collect())
    }
}

/// A pulse with no indicators, created and modified at `modified`.
pub fn bare_pulse(id: &str, modified: DateTime<Utc>) -> Pulse {
    Pulse {
        id: id.to_string(),
        name: format!("pulse {id}"),
        description: String::new(),
        author_name: "testkit".to_string(),
        created: modified,
        modified,
        tags: vec![],
        references: vec![],
        malware_families: vec![],
        attack_ids: vec![],
        indicators: vec![],
        tlp: None,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn alienvault_identity() -> ConnectorIdentity {
    ConnectorIdentity::new("alienvault", "AlienVault")
}

pub fn cycle_with(
    store: Arc<dyn CheckpointStore>,
    tracker: Arc<dyn AuditUnitTracker>,
    delegate: Arc<dyn ImportDelegate>,
) -> RunCycle {
    RunCycle::new(alienvault_identity(), store, tracker, delegate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_delegate_plays_back_in_order() {
        let d = ScriptedDelegate::new();
        d.then_ok(checkpoint(json!({"a": 1}))).then_err("boom");

        let unit = AuditUnitId::new("u");
        let cp = Checkpoint::new();
        assert_eq!(d.import(&cp, &unit).await.unwrap(), checkpoint(json!({"a": 1})));
        assert_eq!(d.import(&cp, &unit).await.unwrap_err().to_string(), "boom");
        assert!(d.import(&cp, &unit).await.unwrap().is_empty());
        assert_eq!(d.seen().len(), 3);
    }

    #[tokio::test]
    async fn failing_store_only_fails_when_told() {
        let s = FailingStore::with_checkpoint(Checkpoint::new());
        s.store(&checkpoint(json!({"k": "v"}))).await.unwrap();
        s.fail_store(true);
        assert!(s.store(&Checkpoint::new()).await.is_err());
        assert_eq!(s.current(), Some(checkpoint(json!({"k": "v"}))));
        assert_eq!(s.writes(), 1);
    }
}

//! One tick of the connector.
//!
//! ```text
//! Idle -> Started -> CheckpointLoaded -> AuditOpened -> Importing
//!      -> Merging -> Persisted -> AuditClosed -> Idle
//! ```
//!
//! `Persisted` is the single commit point. A failure before it leaves the
//! stored checkpoint untouched; the audit unit (if opened) gets one
//! `report_error` and is not closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use otx_audit::{AuditUnitId, AuditUnitTracker};
use otx_checkpoint::{Checkpoint, CheckpointStore};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{CycleError, CyclePhase};
use crate::ImportDelegate;

/// Connector id and human name. Used for the audit label, the success
/// summary and the log prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorIdentity {
    pub id: String,
    pub name: String,
}

impl ConnectorIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Outcome of a successful tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub unit_id: AuditUnitId,
    pub last_run: i64,
    pub checkpoint: Checkpoint,
}

pub struct RunCycle {
    connector: ConnectorIdentity,
    store: Arc<dyn CheckpointStore>,
    tracker: Arc<dyn AuditUnitTracker>,
    delegate: Arc<dyn ImportDelegate>,
    import_timeout: Option<Duration>,
}

impl RunCycle {
    pub fn new(
        connector: ConnectorIdentity,
        store: Arc<dyn CheckpointStore>,
        tracker: Arc<dyn AuditUnitTracker>,
        delegate: Arc<dyn ImportDelegate>,
    ) -> Self {
        Self {
            connector,
            store,
            tracker,
            delegate,
            import_timeout: None,
        }
    }

    /// Bound the `Importing` phase. `None` (the default) waits indefinitely.
    pub fn with_import_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.import_timeout = timeout.filter(|d| !d.is_zero());
        self
    }

    pub fn connector(&self) -> &ConnectorIdentity {
        &self.connector
    }

    /// `last_run` of the persisted checkpoint, for pacing the first tick.
    /// A store error is logged and treated as "never ran".
    pub async fn persisted_last_run(&self) -> Option<i64> {
        match self.store.load().await {
            Ok(cp) => cp.and_then(|cp| cp.last_run()),
            Err(e) => {
                warn!(
                    connector = %self.connector.id,
                    error = %format!("{e:#}"),
                    "could not read checkpoint for first-tick pacing"
                );
                None
            }
        }
    }

    pub async fn tick(&self) -> Result<CycleReport, CycleError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick stamped with `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let span = tracing::info_span!(
            "cycle",
            connector = %self.connector.id,
            name = %self.connector.name
        );
        async move {
            let mut opened: Option<AuditUnitId> = None;
            match self.run_phases(now, &mut opened).await {
                Ok(report) => {
                    debug!(phase = %CyclePhase::Idle, "cycle phase");
                    Ok(report)
                }
                Err(err) => {
                    error!(
                        phase = %err.phase(),
                        committed = err.checkpoint_committed(),
                        "{} connector internal error: {}",
                        self.connector.name,
                        err
                    );
                    if let Some(unit) = opened.as_ref() {
                        if let Err(e) = self.tracker.report_error(unit, &err.to_string()).await {
                            warn!(
                                unit_id = %unit,
                                error = %format!("{e:#}"),
                                "failed to annotate audit unit with the cycle error"
                            );
                        }
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        now: DateTime<Utc>,
        opened: &mut Option<AuditUnitId>,
    ) -> Result<CycleReport, CycleError> {
        let last_run = now.timestamp();
        debug!(phase = %CyclePhase::Started, tick_ts = last_run, "cycle phase");

        let current = self
            .store
            .load()
            .await
            .map_err(CycleError::LoadCheckpoint)?
            .unwrap_or_default();
        info!(phase = %CyclePhase::CheckpointLoaded, "loaded checkpoint: {}", current);

        let label = format!(
            "{} run @ {}",
            self.connector.name,
            now.format("%Y-%m-%d %H:%M:%S")
        );
        let unit = self
            .tracker
            .open(&label)
            .await
            .map_err(CycleError::OpenAudit)?;
        *opened = Some(unit.clone());
        debug!(phase = %CyclePhase::AuditOpened, unit_id = %unit, "cycle phase");

        debug!(phase = %CyclePhase::Importing, unit_id = %unit, "cycle phase");
        let import = self.delegate.import(&current, &unit);
        let partial = match self.import_timeout {
            None => import.await.map_err(CycleError::Import)?,
            Some(limit) => match tokio::time::timeout(limit, import).await {
                Ok(res) => res.map_err(CycleError::Import)?,
                Err(_) => return Err(CycleError::ImportTimedOut(limit)),
            },
        };

        debug!(phase = %CyclePhase::Merging, updated_keys = partial.len(), "cycle phase");
        let next = current.merged(&partial, last_run);

        self.store
            .store(&next)
            .await
            .map_err(CycleError::Persist)?;
        info!(phase = %CyclePhase::Persisted, "stored checkpoint: {}", next);

        let summary = format!(
            "{} connector successfully run, storing last_run as {}",
            self.connector.name, last_run
        );
        self.tracker
            .close(&unit, &summary)
            .await
            .map_err(CycleError::CloseAudit)?;
        info!(phase = %CyclePhase::AuditClosed, unit_id = %unit, last_run, "{}", summary);

        Ok(CycleReport {
            unit_id: unit,
            last_run,
            checkpoint: next,
        })
    }
}

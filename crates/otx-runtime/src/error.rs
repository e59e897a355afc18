use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// States of one tick, in order. `Idle` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Idle,
    Started,
    CheckpointLoaded,
    AuditOpened,
    Importing,
    Merging,
    Persisted,
    AuditClosed,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Started => "started",
            CyclePhase::CheckpointLoaded => "checkpoint_loaded",
            CyclePhase::AuditOpened => "audit_opened",
            CyclePhase::Importing => "importing",
            CyclePhase::Merging => "merging",
            CyclePhase::Persisted => "persisted",
            CyclePhase::AuditClosed => "audit_closed",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed tick. Never propagates past the scheduler.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("load checkpoint failed: {0:#}")]
    LoadCheckpoint(anyhow::Error),

    #[error("open audit unit failed: {0:#}")]
    OpenAudit(anyhow::Error),

    #[error("import failed: {0:#}")]
    Import(anyhow::Error),

    #[error("import timed out after {}s", .0.as_secs())]
    ImportTimedOut(Duration),

    #[error("persist checkpoint failed: {0:#}")]
    Persist(anyhow::Error),

    #[error("close audit unit failed: {0:#}")]
    CloseAudit(anyhow::Error),
}

impl CycleError {
    /// The phase that was being entered when the tick failed.
    pub fn phase(&self) -> CyclePhase {
        match self {
            CycleError::LoadCheckpoint(_) => CyclePhase::CheckpointLoaded,
            CycleError::OpenAudit(_) => CyclePhase::AuditOpened,
            CycleError::Import(_) | CycleError::ImportTimedOut(_) => CyclePhase::Importing,
            CycleError::Persist(_) => CyclePhase::Persisted,
            CycleError::CloseAudit(_) => CyclePhase::AuditClosed,
        }
    }

    /// True when the checkpoint was already committed before the failure.
    pub fn checkpoint_committed(&self) -> bool {
        matches!(self, CycleError::CloseAudit(_))
    }
}

//! otx-runtime
//!
//! The scheduled run cycle:
//! - [`RunCycle`]: one tick. Load checkpoint, open audit unit, import, merge,
//!   persist, close audit unit. Failures are contained per tick.
//! - [`RunScheduler`]: paces ticks (calendar period or fixed interval), never
//!   overlapping, until a shutdown future resolves.
//!
//! Collaborators are injected as trait objects; this crate owns no I/O.

mod cycle;
mod error;
mod scheduler;
mod status;

pub use cycle::{ConnectorIdentity, CycleReport, RunCycle};
pub use error::{CycleError, CyclePhase};
pub use scheduler::{RunScheduler, SchedulerExit};
pub use status::{SchedulerState, SchedulerStatus, TickOutcome};

use otx_audit::AuditUnitId;
use otx_checkpoint::Checkpoint;

/// Performs the fetch / convert / submit work of one tick.
///
/// Receives the current checkpoint (read-only) and the audit unit of the
/// tick; returns only the keys it wants updated. Must be safe to call again
/// with an unchanged checkpoint: a tick that fails after the import replays
/// the same window on the next tick.
#[async_trait::async_trait]
pub trait ImportDelegate: Send + Sync {
    async fn import(&self, checkpoint: &Checkpoint, unit: &AuditUnitId)
        -> anyhow::Result<Checkpoint>;
}

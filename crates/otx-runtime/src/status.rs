//! Scheduler status published over a `tokio::sync::watch` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Starting,
    Waiting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub ok: bool,
    pub started_at: DateTime<Utc>,
    /// Phase the tick failed in; `None` on success.
    pub failed_phase: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub connector_id: String,
    pub cadence: String,
    pub state: SchedulerState,
    pub ticks: u64,
    pub consecutive_failures: u64,
    pub last_outcome: Option<TickOutcome>,
    /// `last_run` of the most recent successful tick of this process.
    pub last_successful_run: Option<i64>,
    pub next_tick_at: Option<DateTime<Utc>>,
}

impl SchedulerStatus {
    pub fn new(connector_id: impl Into<String>, cadence: impl Into<String>) -> Self {
        Self {
            connector_id: connector_id.into(),
            cadence: cadence.into(),
            state: SchedulerState::Starting,
            ticks: 0,
            consecutive_failures: 0,
            last_outcome: None,
            last_successful_run: None,
            next_tick_at: None,
        }
    }
}

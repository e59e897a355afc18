//! Shared state for the status server.

use tokio::sync::watch;

use otx_runtime::SchedulerStatus;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "otx-connector",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Read-only view of the scheduler. The scheduler owns the sender half.
#[derive(Debug, Clone)]
pub struct AppState {
    pub build: BuildInfo,
    pub status: watch::Receiver<SchedulerStatus>,
}

impl AppState {
    pub fn new(status: watch::Receiver<SchedulerStatus>) -> Self {
        Self {
            build: BuildInfo::default(),
            status,
        }
    }
}

/// Seconds since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

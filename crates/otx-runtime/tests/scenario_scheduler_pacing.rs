//! Scenario: scheduler pacing and error containment (paused tokio time)
//!
//! GREEN when:
//! - In interval mode, consecutive tick starts differ by at least N seconds.
//! - A tick that overruns its interval is followed immediately, never
//!   concurrently.
//! - Any number of consecutive failing ticks keeps the scheduler alive and
//!   leaves the checkpoint store unwritten.
//! - A persisted `last_run` younger than one period delays the first tick.
//! - Shutdown during an in-flight tick terminates without committing.
//! - Run-once mode returns `Completed` after exactly one tick, even on failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use otx_audit::{AuditUnitId, AuditUnitTracker};
use otx_checkpoint::{Checkpoint, MemoryCheckpointStore};
use otx_config::Cadence;
use otx_runtime::{
    ConnectorIdentity, ImportDelegate, RunCycle, RunScheduler, SchedulerExit, SchedulerState,
};
use tokio::sync::Notify;
use tokio::time::Instant;

struct NullTracker;

#[async_trait::async_trait]
impl AuditUnitTracker for NullTracker {
    async fn open(&self, _label: &str) -> anyhow::Result<AuditUnitId> {
        Ok(AuditUnitId::new("work"))
    }

    async fn close(&self, _unit: &AuditUnitId, _summary: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn report_error(&self, _unit: &AuditUnitId, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records tick start instants; sleeps `work` per call; fails when `fail`;
/// notifies `done` once `stop_after` calls have started.
struct TimedImport {
    starts: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    work: Duration,
    fail: bool,
    stop_after: usize,
    done: Arc<Notify>,
}

impl TimedImport {
    fn new(work: Duration, fail: bool, stop_after: usize) -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            work,
            fail,
            stop_after,
            done: Arc::new(Notify::new()),
        })
    }

    fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ImportDelegate for TimedImport {
    async fn import(&self, _cp: &Checkpoint, _unit: &AuditUnitId) -> anyhow::Result<Checkpoint> {
        let n = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(Instant::now());
            starts.len()
        };
        let now_in = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in, Ordering::SeqCst);

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if n >= self.stop_after {
            self.done.notify_one();
        }
        if self.fail {
            bail!("upstream 503");
        }
        Ok(Checkpoint::new())
    }
}

fn scheduler(
    store: Arc<MemoryCheckpointStore>,
    import: Arc<TimedImport>,
    cadence: Cadence,
) -> RunScheduler {
    let cycle = RunCycle::new(
        ConnectorIdentity::new("alienvault", "AlienVault"),
        store,
        Arc::new(NullTracker),
        import,
    );
    RunScheduler::new(cycle, cadence)
}

fn gaps(starts: &[Instant]) -> Vec<Duration> {
    starts.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn interval_mode_spaces_tick_starts() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let import = TimedImport::new(Duration::from_secs(5), false, 4);
    let sched = scheduler(store.clone(), import.clone(), Cadence::Interval(Duration::from_secs(60)));

    let done = import.done.clone();
    let exit = sched.run(async move { done.notified().await }).await;

    assert_eq!(exit, SchedulerExit::Terminated);
    let starts = import.starts();
    assert_eq!(starts.len(), 4);
    for gap in gaps(&starts) {
        assert!(gap >= Duration::from_secs(60), "gap {gap:?} shorter than interval");
    }
    assert_eq!(store.writes(), 4);
}

#[tokio::test(start_paused = true)]
async fn overrunning_tick_is_followed_immediately_never_concurrently() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let import = TimedImport::new(Duration::from_secs(90), false, 3);
    let sched = scheduler(store, import.clone(), Cadence::Interval(Duration::from_secs(60)));

    let done = import.done.clone();
    sched.run(async move { done.notified().await }).await;

    let starts = import.starts();
    assert_eq!(starts.len(), 3);
    for gap in gaps(&starts) {
        assert_eq!(gap, Duration::from_secs(90));
    }
    assert_eq!(import.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_ticks_keep_scheduler_alive() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let import = TimedImport::new(Duration::ZERO, true, 5);
    let sched = scheduler(store.clone(), import.clone(), Cadence::Interval(Duration::from_secs(30)));
    let status = sched.subscribe();

    let done = import.done.clone();
    let exit = sched.run(async move { done.notified().await }).await;

    assert_eq!(exit, SchedulerExit::Terminated);
    assert_eq!(import.starts().len(), 5);
    assert_eq!(store.writes(), 0);

    let st = status.borrow().clone();
    assert_eq!(st.state, SchedulerState::Stopped);
    assert_eq!(st.ticks, 5);
    assert_eq!(st.consecutive_failures, 5);
    let last = st.last_outcome.unwrap();
    assert!(!last.ok);
    assert_eq!(last.failed_phase.as_deref(), Some("importing"));
}

#[tokio::test(start_paused = true)]
async fn recent_last_run_delays_first_tick() {
    let mut cp = Checkpoint::new();
    cp.insert(Checkpoint::LAST_RUN, Utc::now().timestamp() - 10);
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(cp));
    let import = TimedImport::new(Duration::ZERO, false, 1);
    let sched = scheduler(store, import.clone(), Cadence::Interval(Duration::from_secs(60)));

    let t0 = Instant::now();
    let done = import.done.clone();
    sched.run(async move { done.notified().await }).await;

    let first = import.starts()[0] - t0;
    assert!(
        first >= Duration::from_secs(49) && first <= Duration::from_secs(51),
        "first tick after {first:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_tick_does_not_commit() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let import = TimedImport::new(Duration::from_secs(1_000), false, usize::MAX);
    let sched = scheduler(store.clone(), import.clone(), Cadence::Interval(Duration::from_secs(60)));

    let exit = sched
        .run(tokio::time::sleep(Duration::from_secs(5)))
        .await;

    assert_eq!(exit, SchedulerExit::Terminated);
    assert_eq!(import.starts().len(), 1);
    assert_eq!(store.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_once_completes_after_single_failed_tick() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let import = TimedImport::new(Duration::ZERO, true, usize::MAX);
    let sched = scheduler(store.clone(), import.clone(), Cadence::Interval(Duration::from_secs(60)))
        .run_once(true);

    let exit = sched.run(std::future::pending::<()>()).await;

    assert_eq!(exit, SchedulerExit::Completed);
    assert_eq!(import.starts().len(), 1);
    assert_eq!(store.writes(), 0);
}

//! Tick pacing.
//!
//! Each tick's deadline is computed from the previous tick's start, and the
//! next wait begins only after the tick has returned, so ticks never overlap
//! and consecutive starts are at least one period apart. A tick that overruns
//! its period is followed immediately by the next one.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use otx_config::Cadence;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::cycle::RunCycle;
use crate::status::{SchedulerState, SchedulerStatus, TickOutcome};

// Far enough out to mean "never" without overflowing `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// The shutdown future resolved.
    Terminated,
    /// Run-once mode finished its single tick.
    Completed,
}

pub struct RunScheduler {
    cycle: RunCycle,
    cadence: Cadence,
    run_once: bool,
    status: watch::Sender<SchedulerStatus>,
}

impl RunScheduler {
    pub fn new(cycle: RunCycle, cadence: Cadence) -> Self {
        let initial = SchedulerStatus::new(cycle.connector().id.clone(), cadence.to_string());
        let (status, _rx) = watch::channel(initial);
        Self {
            cycle,
            cadence,
            run_once: false,
            status,
        }
    }

    /// Run a single tick, then return [`SchedulerExit::Completed`].
    pub fn run_once(mut self, yes: bool) -> Self {
        self.run_once = yes;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    pub fn cycle(&self) -> &RunCycle {
        &self.cycle
    }

    /// Drive ticks until `shutdown` resolves (or the single tick of run-once
    /// mode returns). Cycle errors are contained; they never end the loop.
    ///
    /// Shutdown is observed both while waiting and while a tick is in flight;
    /// in the latter case the tick is dropped before its commit point.
    pub async fn run<F>(&self, shutdown: F) -> SchedulerExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            connector = %self.cycle.connector().id,
            cadence = %self.cadence,
            run_once = self.run_once,
            "scheduler started"
        );

        let first_delay = if self.run_once {
            Duration::ZERO
        } else {
            let last_run = self.cycle.persisted_last_run().await;
            initial_delay(&self.cadence, last_run, Utc::now())
        };
        if !first_delay.is_zero() {
            info!(
                delay_secs = first_delay.as_secs(),
                "previous run is recent; delaying first tick"
            );
        }
        let mut deadline = deadline_after(Instant::now(), first_delay);

        loop {
            let next_wall = wall_after(Utc::now(), deadline.saturating_duration_since(Instant::now()));
            self.status.send_modify(|s| {
                s.state = SchedulerState::Waiting;
                s.next_tick_at = next_wall;
            });

            tokio::select! {
                biased;
                _ = &mut shutdown => return self.stop(),
                _ = sleep_until(deadline) => {}
            }

            let started = Instant::now();
            let started_wall = Utc::now();
            self.status.send_modify(|s| {
                s.state = SchedulerState::Running;
                s.next_tick_at = None;
            });

            let result = tokio::select! {
                biased;
                _ = &mut shutdown => return self.stop(),
                r = self.cycle.tick_at(started_wall) => r,
            };

            self.status.send_modify(|s| {
                s.ticks += 1;
                match &result {
                    Ok(report) => {
                        s.consecutive_failures = 0;
                        s.last_successful_run = Some(report.last_run);
                        s.last_outcome = Some(TickOutcome {
                            ok: true,
                            started_at: started_wall,
                            failed_phase: None,
                            error: None,
                        });
                    }
                    Err(err) => {
                        s.consecutive_failures += 1;
                        s.last_outcome = Some(TickOutcome {
                            ok: false,
                            started_at: started_wall,
                            failed_phase: Some(err.phase().to_string()),
                            error: Some(err.to_string()),
                        });
                    }
                }
            });
            if let Err(err) = &result {
                warn!(
                    phase = %err.phase(),
                    consecutive_failures = self.status.borrow().consecutive_failures,
                    "tick failed; waiting for next tick"
                );
            }

            if self.run_once {
                self.status.send_modify(|s| s.state = SchedulerState::Stopped);
                info!("run-once tick finished; connector stopping...");
                return SchedulerExit::Completed;
            }

            deadline = deadline_after(started, period_from(&self.cadence, started_wall));
        }
    }

    fn stop(&self) -> SchedulerExit {
        self.status.send_modify(|s| {
            s.state = SchedulerState::Stopped;
            s.next_tick_at = None;
        });
        info!("connector stopping...");
        SchedulerExit::Terminated
    }
}

/// Length of the period starting at `start` (calendar-aware in period mode).
fn period_from(cadence: &Cadence, start: DateTime<Utc>) -> Duration {
    (cadence.next_after(start) - start)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Delay before the first tick: zero unless the persisted `last_run` is less
/// than one period ago. Never longer than one period from `now`.
fn initial_delay(cadence: &Cadence, last_run: Option<i64>, now: DateTime<Utc>) -> Duration {
    let Some(last) = last_run.and_then(|secs| Utc.timestamp_opt(secs, 0).single()) else {
        return Duration::ZERO;
    };
    let one_period = period_from(cadence, now);
    if last > now {
        warn!(
            last_run = %last,
            now = %now,
            "persisted last_run is in the future; waiting one period at most"
        );
        return one_period;
    }
    (cadence.next_after(last) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(one_period)
}

fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay.min(FAR_FUTURE))
        .unwrap_or(start)
}

fn wall_after(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use otx_config::IsoDuration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn no_previous_run_starts_immediately() {
        let c = Cadence::Interval(Duration::from_secs(60));
        assert_eq!(initial_delay(&c, None, at(1_000)), Duration::ZERO);
    }

    #[test]
    fn recent_previous_run_delays_until_period_elapsed() {
        let c = Cadence::Interval(Duration::from_secs(60));
        assert_eq!(
            initial_delay(&c, Some(1_000), at(1_010)),
            Duration::from_secs(50)
        );
        assert_eq!(initial_delay(&c, Some(1_000), at(1_060)), Duration::ZERO);
        assert_eq!(initial_delay(&c, Some(1_000), at(5_000)), Duration::ZERO);
    }

    #[test]
    fn future_previous_run_waits_one_period_at_most() {
        let c = Cadence::Interval(Duration::from_secs(60));
        assert_eq!(
            initial_delay(&c, Some(1_000 + 864_000), at(1_000)),
            Duration::from_secs(60)
        );
        assert_eq!(
            initial_delay(&c, Some(1_001), at(1_000)),
            Duration::from_secs(60)
        );

        let monthly = Cadence::Period(IsoDuration::parse("P1M").unwrap());
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let next_year = feb.timestamp() + 365 * 86_400;
        assert_eq!(
            initial_delay(&monthly, Some(next_year), feb),
            Duration::from_secs(29 * 86_400)
        );
    }

    #[test]
    fn period_mode_uses_calendar_length() {
        let c = Cadence::Period(IsoDuration::parse("P1M").unwrap());
        // 2024-02-01T00:00:00Z; February 2024 has 29 days.
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(period_from(&c, feb), Duration::from_secs(29 * 86_400));
    }

    #[test]
    fn huge_delay_does_not_overflow() {
        let now = Instant::now();
        let d = deadline_after(now, Duration::from_secs(u64::MAX));
        assert!(d > now);
    }
}

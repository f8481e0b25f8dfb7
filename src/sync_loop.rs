//! Continuous sync loop.
//!
//! ```text
//! Idle → CycleRunning → Waiting → CycleRunning → … → ShuttingDown → Terminated
//! ```
//!
//! Each cycle is a one-shot run over a window chosen by the
//! [`WindowStrategy`]. Remote sources use [`WindowStrategy::IncrementalWindow`]:
//! the first cycle looks back the configured number of hours and later
//! cycles look back just far enough to cover the time since the previous
//! cycle started, plus a safety buffer. Local directories cannot be listed
//! by modification window and use [`WindowStrategy::Rescan`], which scans
//! the whole tree every cycle.
//!
//! A shutdown request moves the loop to `ShuttingDown` as soon as it
//! arrives. A cycle in progress still finishes its current group, its
//! summary is printed, and no new cycle is scheduled.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest::{print_summary, Ingestor};
use crate::models::TimeWindow;
use crate::traits::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    CycleRunning,
    Waiting,
    ShuttingDown,
    Terminated,
}

/// Bookkeeping carried from one cycle to the next.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleState {
    /// Start time of the last cycle whose listing succeeded.
    pub last_sync: Option<DateTime<Utc>>,
    pub cycle_count: u64,
    /// States entered after `Idle`, in order.
    pub states: Vec<SyncState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStrategy {
    IncrementalWindow {
        initial_hours: u32,
        safety_buffer_minutes: i64,
    },
    /// Full re-scan every cycle.
    Rescan,
}

impl WindowStrategy {
    pub fn for_source(kind: SourceKind, initial_hours: u32, safety_buffer_minutes: i64) -> Self {
        match kind {
            SourceKind::Remote => WindowStrategy::IncrementalWindow {
                initial_hours,
                safety_buffer_minutes,
            },
            SourceKind::Local => WindowStrategy::Rescan,
        }
    }

    /// Window for the next cycle, or `None` for a full scan.
    pub fn next_window(&self, cycle: &SyncCycleState, now: DateTime<Utc>) -> Option<TimeWindow> {
        match *self {
            WindowStrategy::Rescan => None,
            WindowStrategy::IncrementalWindow {
                initial_hours,
                safety_buffer_minutes,
            } => {
                let hours = match cycle.last_sync {
                    None => initial_hours.max(1),
                    Some(last) => lookback_hours(last, now, safety_buffer_minutes),
                };
                Some(TimeWindow::last_hours(hours, now))
            }
        }
    }
}

/// `max(1, ceil((minutes since last_sync + buffer) / 60))`.
///
/// A clock that moved backwards counts as zero elapsed time.
pub fn lookback_hours(last_sync: DateTime<Utc>, now: DateTime<Utc>, buffer_minutes: i64) -> u32 {
    let elapsed_secs = (now - last_sync).num_seconds().max(0);
    let total_secs = elapsed_secs + buffer_minutes.max(0) * 60;
    let hours = (total_secs + 3599) / 3600;
    u32::try_from(hours.max(1)).unwrap_or(u32::MAX)
}

fn transition(state: &mut SyncState, next: SyncState, cycle: &mut SyncCycleState) {
    debug!(from = ?state, to = ?next, "sync state");
    *state = next;
    cycle.states.push(next);
}

/// Run cycles until `cancel` fires. Listing failures are logged and the
/// loop carries on with the next cycle.
pub async fn run_continuous(
    ingestor: &Ingestor,
    strategy: WindowStrategy,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<SyncCycleState> {
    let mut state = SyncState::Idle;
    let mut cycle = SyncCycleState::default();
    let label = ingestor.label();

    if strategy == WindowStrategy::Rescan {
        warn!(
            source = %label,
            "local sources cannot be synced incrementally; every cycle re-scans the whole tree"
        );
    }
    info!(source = %label, interval_secs = interval.as_secs(), "continuous sync started");

    while !cancel.is_cancelled() {
        transition(&mut state, SyncState::CycleRunning, &mut cycle);
        let started = Utc::now();
        let window = strategy.next_window(&cycle, started);
        if let Some(w) = &window {
            info!(cycle = cycle.cycle_count + 1, start = %w.start, end = %w.end, "sync cycle");
        } else {
            info!(cycle = cycle.cycle_count + 1, "sync cycle (full scan)");
        }

        let run = ingestor.run_once(window.as_ref(), cancel);
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if state != SyncState::ShuttingDown => {
                    info!(source = %label, "shutdown requested, finishing current group");
                    transition(&mut state, SyncState::ShuttingDown, &mut cycle);
                }
                result = &mut run => break result,
            }
        };

        match result {
            Ok(stats) => {
                print_summary(&label, &stats, ingestor.options().max_reported_errors);
                cycle.last_sync = Some(started);
            }
            Err(e) => error!(source = %label, error = %e, "sync cycle failed"),
        }
        cycle.cycle_count += 1;

        if state == SyncState::ShuttingDown {
            break;
        }
        transition(&mut state, SyncState::Waiting, &mut cycle);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if state != SyncState::ShuttingDown {
        transition(&mut state, SyncState::ShuttingDown, &mut cycle);
    }
    info!(cycles = cycle.cycle_count, "continuous sync stopping");
    transition(&mut state, SyncState::Terminated, &mut cycle);
    Ok(cycle)
}

//! Batch scheduler.
//!
//! Records are split into batches of `batch_size`; batches are split into
//! groups of `concurrency`. Groups run one after another. Within a group,
//! every batch is in flight at once and, within a batch, every record is.
//! At most `batch_size × concurrency` records are therefore in progress.
//!
//! Everything runs on the calling task. Each batch accumulates its own
//! [`BatchResult`], which is merged into the run's [`LoadStats`] as the
//! batch completes, so no counter is shared between workers.
//!
//! Cancellation is checked before each group is dispatched. A group that
//! has started always runs to completion.

use std::future::Future;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{BatchResult, LoadStats, RecordOutcome};
use crate::progress::{rate_and_eta, SyncProgressEvent, SyncProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub concurrency: usize,
}

/// Split `items` into consecutive chunks of at most `size` items.
pub fn into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Run `worker` over every record and return the merged totals.
///
/// The worker reports failures through [`RecordOutcome::Failed`]; one
/// record's failure never affects its batch-mates.
pub async fn run_batches<T, F, Fut>(
    records: Vec<T>,
    opts: &BatchOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgressReporter,
    label: &str,
    worker: F,
) -> LoadStats
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = RecordOutcome>,
{
    let mut stats = LoadStats {
        total: records.len() as u64,
        ..LoadStats::default()
    };
    let started = Instant::now();
    let concurrency = opts.concurrency.max(1);
    let worker = &worker;

    let mut batches = into_batches(records, opts.batch_size).into_iter();
    let mut group_index = 0usize;

    loop {
        let group: Vec<Vec<T>> = batches.by_ref().take(concurrency).collect();
        if group.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            info!(
                source = label,
                processed = stats.processed,
                total = stats.total,
                "shutdown requested, not dispatching further batches"
            );
            stats.cancelled = true;
            break;
        }

        group_index += 1;
        debug!(source = label, group = group_index, batches = group.len(), "dispatching group");

        let mut in_flight: FuturesUnordered<_> = group
            .into_iter()
            .map(|batch| async move {
                let mut result = BatchResult::default();
                for outcome in join_all(batch.into_iter().map(worker)).await {
                    result.record(outcome);
                }
                result
            })
            .collect();

        while let Some(result) = in_flight.next().await {
            stats.merge(result);
            let (rate, eta) = rate_and_eta(stats.processed, stats.total, started.elapsed());
            progress.report(SyncProgressEvent::Loading {
                source: label.to_string(),
                processed: stats.processed,
                total: stats.total,
                rate,
                eta,
            });
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{RecordFailure, SkipReason};
    use crate::progress::NoProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn opts(batch_size: usize, concurrency: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            concurrency,
        }
    }

    struct CountingProgress {
        events: Mutex<Vec<u64>>,
    }

    impl SyncProgressReporter for CountingProgress {
        fn report(&self, event: SyncProgressEvent) {
            if let SyncProgressEvent::Loading { processed, .. } = event {
                self.events.lock().unwrap().push(processed);
            }
        }
    }

    #[test]
    fn batches_are_chunked_in_order() {
        let batches = into_batches((0..120).collect(), 50);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(batches[2][0], 100);
        assert!(into_batches(Vec::<u8>::new(), 50).is_empty());
    }

    #[tokio::test]
    async fn all_records_processed_once() {
        let progress = CountingProgress {
            events: Mutex::new(Vec::new()),
        };
        let stats = run_batches(
            (0..120).collect::<Vec<u32>>(),
            &opts(50, 3),
            &CancellationToken::new(),
            &progress,
            "test",
            |_| async { RecordOutcome::Ingested { migrated: false } },
        )
        .await;

        assert_eq!(stats.total, 120);
        assert_eq!(stats.processed, 120);
        assert_eq!(stats.succeeded, 120);
        assert!(!stats.cancelled);

        let events = progress.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(*events.last().unwrap(), 120);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_batch_times_concurrency() {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let stats = run_batches(
            (0..40).collect::<Vec<u32>>(),
            &opts(4, 2),
            &CancellationToken::new(),
            &NoProgress,
            "test",
            |_| {
                let current = &current;
                let peak = &peak;
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    RecordOutcome::Ingested { migrated: false }
                }
            },
        )
        .await;

        assert_eq!(stats.processed, 40);
        assert!(peak.load(Ordering::SeqCst) <= 8);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_batch_mates() {
        let stats = run_batches(
            (0..10).collect::<Vec<u32>>(),
            &opts(5, 2),
            &CancellationToken::new(),
            &NoProgress,
            "test",
            |n| async move {
                match n {
                    3 => RecordOutcome::Failed(RecordFailure {
                        identifier: n.to_string(),
                        kind: ErrorKind::Parse,
                        message: "invalid JSON".to_string(),
                    }),
                    7 => RecordOutcome::Skipped(SkipReason::AlreadyTracked),
                    _ => RecordOutcome::Ingested { migrated: n % 2 == 0 },
                }
            },
        )
        .await;

        assert_eq!(stats.succeeded, 8);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.migrated, 4);
        assert_eq!(stats.failures[0].identifier, "3");
    }

    #[tokio::test]
    async fn cancellation_lets_current_group_finish() {
        let cancel = CancellationToken::new();
        let stats = run_batches(
            (0..10).collect::<Vec<u32>>(),
            &opts(2, 2),
            &cancel,
            &NoProgress,
            "test",
            |_| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    RecordOutcome::Ingested { migrated: false }
                }
            },
        )
        .await;

        assert!(stats.cancelled);
        assert_eq!(stats.total, 10);
        assert_eq!(stats.processed, 4);
    }
}

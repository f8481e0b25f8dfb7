//! Ingestion pipeline orchestration.
//!
//! Coordinates one sync run: source listing → dedup check → parse →
//! normalization → validation → store write (with retry) → dedup record.
//! After the records are loaded the store's tag backfill runs once; its
//! failure is logged and never fails the run.
//!
//! [`run_sync`] is the `vcon-sync sync` command: it wires the configured
//! backends together and runs either once or continuously.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{run_batches, BatchOptions};
use crate::config::{Config, LocalSourceConfig};
use crate::connector_fs::LocalSource;
use crate::connector_s3::{AwsCredentials, S3Source};
use crate::db;
use crate::dedup;
use crate::error::{ErrorKind, RecordError};
use crate::migrate;
use crate::models::{
    CandidateRecord, LoadStats, RawDocument, RecordFailure, RecordOutcome, SkipReason, TimeWindow,
};
use crate::normalize::normalize;
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::retry::{with_retry, RetryOutcome, RetryPolicy};
use crate::sqlite_store::SqliteVconStore;
use crate::sync_loop::{run_continuous, WindowStrategy};
use crate::traits::{DedupTracker, RecordSource, SourceKind, VconStore};

/// Tunables for one [`Ingestor`].
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch: BatchOptions,
    /// Policy for per-record writes.
    pub retry: RetryPolicy,
    /// Policy for the post-run tag backfill.
    pub backfill_retry: RetryPolicy,
    /// Parse, normalize and validate, but write nothing.
    pub dry_run: bool,
    pub max_reported_errors: usize,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        let ingest = &config.ingest;
        let base_delay = Duration::from_millis(ingest.retry_delay_ms);
        Self {
            batch: BatchOptions {
                batch_size: ingest.batch_size,
                concurrency: ingest.concurrency,
            },
            retry: RetryPolicy::linear(ingest.retry_attempts, base_delay),
            backfill_retry: RetryPolicy::exponential(ingest.retry_attempts, base_delay),
            dry_run: false,
            max_reported_errors: ingest.max_reported_errors,
        }
    }
}

/// One source wired to one store and one dedup tracker.
pub struct Ingestor {
    source: Box<dyn RecordSource>,
    store: Arc<dyn VconStore>,
    dedup: Arc<dyn DedupTracker>,
    progress: Box<dyn SyncProgressReporter>,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(
        source: Box<dyn RecordSource>,
        store: Arc<dyn VconStore>,
        dedup: Arc<dyn DedupTracker>,
        progress: Box<dyn SyncProgressReporter>,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            store,
            dedup,
            progress,
            options,
        }
    }

    pub fn label(&self) -> String {
        self.source.label()
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Take one candidate through the pipeline. Never panics and never
    /// returns an error: every failure becomes [`RecordOutcome::Failed`].
    pub async fn process_record(&self, record: CandidateRecord) -> RecordOutcome {
        let id = record.identifier.as_str();

        if self.dedup.has(id).await {
            debug!(id, "already ingested, skipping");
            return RecordOutcome::Skipped(SkipReason::AlreadyTracked);
        }

        let raw = match RawDocument::parse(&record.content) {
            Ok(raw) => raw,
            Err(e) => return failed(id, e),
        };
        let normalized = normalize(raw);
        let migrated = normalized.migrated;
        let vcon = match normalized.to_vcon() {
            Ok(vcon) => vcon,
            Err(e) => return failed(id, e),
        };

        if self.options.dry_run {
            return RecordOutcome::Ingested { migrated };
        }

        let store = &*self.store;
        let location = record.source_location.as_str();
        match with_retry(&self.options.retry, id, || store.insert_vcon(&vcon, location)).await {
            Ok(RetryOutcome::Completed(())) => {
                self.dedup.add(id).await;
                RecordOutcome::Ingested { migrated }
            }
            Ok(RetryOutcome::AlreadyExists) => {
                self.dedup.add(id).await;
                RecordOutcome::Skipped(SkipReason::DuplicateOnWrite)
            }
            Err(e) => failed(
                id,
                RecordError::Write {
                    attempts: e.attempts,
                    detail: e.detail,
                },
            ),
        }
    }

    /// One full run over `window` (`None` lists everything the source has).
    ///
    /// Returns an error only when the source cannot be listed.
    pub async fn run_once(
        &self,
        window: Option<&TimeWindow>,
        cancel: &CancellationToken,
    ) -> Result<LoadStats> {
        let label = self.label();
        self.progress.report(SyncProgressEvent::Discovering {
            source: label.clone(),
        });

        let records = self.source.enumerate(window).await?;
        info!(source = %label, candidates = records.len(), dry_run = self.options.dry_run, "listing complete");

        let stats = run_batches(
            records,
            &self.options.batch,
            cancel,
            &*self.progress,
            &label,
            |record| self.process_record(record),
        )
        .await;

        if !self.options.dry_run {
            self.backfill_tags().await;
        }

        Ok(stats)
    }

    async fn backfill_tags(&self) {
        let store = &*self.store;
        match with_retry(&self.options.backfill_retry, "populate_tags", || {
            store.populate_tags()
        })
        .await
        {
            Ok(RetryOutcome::Completed(updated)) => {
                debug!(updated, "tags backfilled");
            }
            Ok(RetryOutcome::AlreadyExists) => {}
            Err(e) => warn!(error = %e, "tag backfill failed"),
        }
    }
}

fn failed(identifier: &str, err: RecordError) -> RecordOutcome {
    let failure = RecordFailure {
        identifier: identifier.to_string(),
        kind: err.kind(),
        message: err.to_string(),
    };
    debug!(id = identifier, kind = %failure.kind, error = %failure.message, "record failed");
    RecordOutcome::Failed(failure)
}

/// Print the end-of-run report on stdout.
pub fn print_summary(label: &str, stats: &LoadStats, max_errors: usize) {
    print!("{}", render_summary(label, stats, max_errors));
}

/// Summary text: counts, then the first `max_errors` failures grouped by kind.
pub fn render_summary(label: &str, stats: &LoadStats, max_errors: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("sync {}\n", label));
    out.push_str(&format!("  candidates: {}\n", stats.total));
    out.push_str(&format!("  processed: {}\n", stats.processed));
    out.push_str(&format!("  succeeded: {}\n", stats.succeeded));
    out.push_str(&format!("  migrated: {}\n", stats.migrated));
    out.push_str(&format!("  skipped: {}\n", stats.skipped));
    out.push_str(&format!("  failed: {}\n", stats.failed));
    if stats.cancelled {
        out.push_str("  interrupted: remaining batches were not dispatched\n");
    }

    if !stats.failures.is_empty() && max_errors > 0 {
        let mut by_kind: BTreeMap<ErrorKind, Vec<&RecordFailure>> = BTreeMap::new();
        for failure in stats.failures.iter().take(max_errors) {
            by_kind.entry(failure.kind).or_default().push(failure);
        }
        for (kind, failures) in by_kind {
            out.push_str(&format!("  {} errors:\n", kind));
            for failure in failures {
                out.push_str(&format!("    {}: {}\n", failure.identifier, failure.message));
            }
        }
        if stats.failures.len() > max_errors {
            out.push_str(&format!(
                "    ... and {} more\n",
                stats.failures.len() - max_errors
            ));
        }
    }

    out.push_str("ok\n");
    out
}

/// Options for `vcon-sync sync`. `None` fields fall back to the config file.
#[derive(Debug, Clone)]
pub struct SyncArgs {
    pub dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub hours: Option<u32>,
    pub prefix: Option<String>,
    pub dry_run: bool,
    pub continuous: bool,
    pub interval_secs: Option<u64>,
    pub no_dedup: bool,
    pub progress: ProgressMode,
}

fn apply_overrides(config: &Config, args: &SyncArgs) -> Config {
    let mut config = config.clone();
    if let Some(n) = args.batch_size {
        config.ingest.batch_size = n;
    }
    if let Some(n) = args.concurrency {
        config.ingest.concurrency = n;
    }
    if let Some(n) = args.retry_attempts {
        config.ingest.retry_attempts = n;
    }
    if let Some(ms) = args.retry_delay_ms {
        config.ingest.retry_delay_ms = ms;
    }
    if let Some(h) = args.hours {
        config.sync.lookback_hours = h;
    }
    if let Some(secs) = args.interval_secs {
        config.sync.interval_secs = secs;
    }
    if let (Some(prefix), Some(s3)) = (&args.prefix, config.source.s3.as_mut()) {
        s3.prefix = prefix.clone();
    }
    if args.no_dedup {
        config.dedup.enabled = false;
    }
    config
}

fn build_source(config: &Config, dir: Option<&PathBuf>) -> Result<Box<dyn RecordSource>> {
    if let Some(dir) = dir {
        let mut local = config
            .source
            .local
            .clone()
            .unwrap_or_else(|| LocalSourceConfig::for_root(dir.clone()));
        local.root = dir.clone();
        return Ok(Box::new(LocalSource::new(local)?));
    }
    if let Some(s3) = &config.source.s3 {
        let creds = AwsCredentials::from_env()?;
        return Ok(Box::new(S3Source::new(s3.clone(), creds)));
    }
    if let Some(local) = &config.source.local {
        return Ok(Box::new(LocalSource::new(local.clone())?));
    }
    bail!("No source to sync: pass a directory or configure [source.s3] or [source.local]")
}

/// The `vcon-sync sync` command.
pub async fn run_sync(config: &Config, args: SyncArgs) -> Result<()> {
    let config = apply_overrides(config, &args);
    if config.ingest.batch_size == 0 || config.ingest.concurrency == 0 {
        bail!("--batch-size and --concurrency must be > 0");
    }
    if config.ingest.retry_attempts == 0 || config.sync.lookback_hours == 0 {
        bail!("--retry-attempts and --hours must be >= 1");
    }

    let source = build_source(&config, args.dir.as_ref())?;
    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;

    let store: Arc<dyn VconStore> = Arc::new(SqliteVconStore::new(pool.clone()));
    let dedup: Arc<dyn DedupTracker> = Arc::from(dedup::init(&config.dedup).await);

    let mut options = IngestOptions::from_config(&config);
    options.dry_run = args.dry_run;

    let ingestor = Ingestor::new(
        source,
        store,
        dedup.clone(),
        args.progress.reporter(),
        options,
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current group before exiting");
            signal_token.cancel();
        }
    });

    let strategy = WindowStrategy::for_source(
        ingestor.source_kind(),
        config.sync.lookback_hours,
        config.sync.safety_buffer_minutes,
    );

    let outcome = if args.continuous {
        let interval = Duration::from_secs(config.sync.interval_secs);
        run_continuous(&ingestor, strategy, interval, &cancel)
            .await
            .map(|_| ())
    } else {
        let window = strategy.next_window(&Default::default(), Utc::now());
        ingestor
            .run_once(window.as_ref(), &cancel)
            .await
            .map(|stats| print_summary(&ingestor.label(), &stats, config.ingest.max_reported_errors))
    };

    info!(backend = dedup.backend(), tracked = dedup.cardinality().await, "dedup state");
    if let Err(e) = dedup.close().await {
        warn!(error = %e, "failed to flush dedup state");
    }
    pool.close().await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with_failures(n: usize) -> LoadStats {
        let mut stats = LoadStats {
            total: 20,
            processed: 20,
            succeeded: (20 - n) as u64,
            failed: n as u64,
            ..LoadStats::default()
        };
        for i in 0..n {
            stats.failures.push(RecordFailure {
                identifier: format!("id-{}", i),
                kind: if i % 2 == 0 {
                    ErrorKind::Parse
                } else {
                    ErrorKind::Validation
                },
                message: "bad".to_string(),
            });
        }
        stats
    }

    #[test]
    fn summary_groups_errors_by_kind() {
        let text = render_summary("local:/data", &stats_with_failures(4), 10);
        assert!(text.starts_with("sync local:/data\n"));
        assert!(text.contains("  failed: 4\n"));
        let parse_at = text.find("parse errors:").unwrap();
        let validation_at = text.find("validation errors:").unwrap();
        assert!(parse_at < validation_at);
        assert!(text.ends_with("ok\n"));
    }

    #[test]
    fn summary_caps_reported_errors() {
        let text = render_summary("s3:archive", &stats_with_failures(15), 10);
        assert_eq!(text.matches("    id-").count(), 10);
        assert!(text.contains("... and 5 more"));
    }

    #[test]
    fn cli_overrides_win() {
        let config: Config = toml::from_str(
            "[db]\npath = \"x\"\n[source.s3]\nbucket = \"b\"\nprefix = \"old/\"\n",
        )
        .unwrap();
        let args = SyncArgs {
            dir: None,
            batch_size: Some(10),
            concurrency: None,
            retry_attempts: None,
            retry_delay_ms: None,
            hours: Some(2),
            prefix: Some("new/".to_string()),
            dry_run: false,
            continuous: false,
            interval_secs: None,
            no_dedup: true,
            progress: ProgressMode::Off,
        };
        let merged = apply_overrides(&config, &args);
        assert_eq!(merged.ingest.batch_size, 10);
        assert_eq!(merged.ingest.concurrency, 3);
        assert_eq!(merged.sync.lookback_hours, 2);
        assert_eq!(merged.source.s3.unwrap().prefix, "new/");
        assert!(!merged.dedup.enabled);
    }
}

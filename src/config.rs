//! TOML configuration parsing.
//!
//! ```toml
//! [db]
//! path = "./data/vcons.sqlite"
//!
//! [source.s3]
//! bucket = "conserver-archive"
//! prefix = "vcons/"
//! region = "us-east-1"
//! suffix = ".json"
//! partition_format = "%Y/%m/%d/"
//!
//! [dedup]
//! redis_url = "redis://127.0.0.1:6379"
//!
//! [ingest]
//! batch_size = 50
//! concurrency = 3
//!
//! [sync]
//! interval_secs = 300
//! ```
//!
//! Every section except `[db]` is optional and falls back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    pub s3: Option<S3SourceConfig>,
    pub local: Option<LocalSourceConfig>,
}

/// Remote object store holding one JSON document per vCon, laid out in
/// calendar-day partitions under `prefix`.
#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack). Requests use path-style addressing.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// strftime pattern appended to `prefix` for each day in the window.
    #[serde(default = "default_partition_format")]
    pub partition_format: String,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl LocalSourceConfig {
    /// Config for an ad-hoc directory given on the command line.
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            root,
            suffix: default_suffix(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_suffix() -> String {
    ".json".to_string()
}
fn default_partition_format() -> String {
    "%Y/%m/%d/".to_string()
}
fn default_fetch_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_set_key")]
    pub set_key: String,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_persist_every")]
    pub persist_every: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            set_key: default_set_key(),
            snapshot_path: default_snapshot_path(),
            persist_every: default_persist_every(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_set_key() -> String {
    "vcon:ingested".to_string()
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from(".vcon-sync-dedup.json")
}
fn default_persist_every() -> usize {
    1000
}
fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_reported_errors")]
    pub max_reported_errors: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_reported_errors: default_max_reported_errors(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_concurrency() -> usize {
    3
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_reported_errors() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_safety_buffer_minutes")]
    pub safety_buffer_minutes: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lookback_hours: default_lookback_hours(),
            safety_buffer_minutes: default_safety_buffer_minutes(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_safety_buffer_minutes() -> i64 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be > 0");
    }
    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be > 0");
    }
    if config.ingest.retry_attempts == 0 {
        anyhow::bail!("ingest.retry_attempts must be >= 1");
    }
    if config.sync.lookback_hours == 0 {
        anyhow::bail!("sync.lookback_hours must be >= 1");
    }
    if config.dedup.persist_every == 0 {
        anyhow::bail!("dedup.persist_every must be > 0");
    }

    if let Some(s3) = &config.source.s3 {
        if s3.bucket.trim().is_empty() {
            anyhow::bail!("source.s3.bucket must not be empty");
        }
        if s3.fetch_concurrency == 0 {
            anyhow::bail!("source.s3.fetch_concurrency must be > 0");
        }
        // chrono reports bad specifiers lazily, at format time
        let formatted = chrono::Utc::now().format(&s3.partition_format);
        if std::fmt::write(&mut String::new(), format_args!("{}", formatted)).is_err() {
            anyhow::bail!(
                "source.s3.partition_format is not a valid strftime pattern: '{}'",
                s3.partition_format
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/vcons.sqlite\"\n").unwrap();
        assert_eq!(config.ingest.batch_size, 50);
        assert_eq!(config.ingest.concurrency, 3);
        assert_eq!(config.dedup.set_key, "vcon:ingested");
        assert_eq!(config.dedup.persist_every, 1000);
        assert!(config.dedup.enabled);
        assert!(config.source.s3.is_none());
        assert_eq!(config.sync.safety_buffer_minutes, 5);
    }

    #[test]
    fn s3_section_defaults() {
        let config = parse(
            r#"
[db]
path = "x.sqlite"

[source.s3]
bucket = "archive"
"#,
        )
        .unwrap();
        let s3 = config.source.s3.unwrap();
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.suffix, ".json");
        assert_eq!(s3.partition_format, "%Y/%m/%d/");
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse(include_str!("../config/vcon-sync.example.toml")).unwrap();
        assert_eq!(config.source.s3.unwrap().bucket, "conserver-archive");
        assert!(config.source.local.is_none());
        assert_eq!(config.sync.interval_secs, 300);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = parse("[db]\npath = \"x\"\n[ingest]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn rejects_bad_partition_format() {
        let err = parse(
            "[db]\npath = \"x\"\n[source.s3]\nbucket = \"b\"\npartition_format = \"%Q/\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("partition_format"));
    }
}

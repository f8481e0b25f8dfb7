//! Local directory source.
//!
//! Walks a directory tree and yields every file ending in the configured
//! suffix. A local tree has no date partitions, so the time window is
//! ignored and every cycle is a full re-scan. The walk runs on the
//! blocking thread pool.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LocalSourceConfig;
use crate::models::{CandidateRecord, TimeWindow};
use crate::traits::{RecordSource, SourceKind};

pub struct LocalSource {
    config: LocalSourceConfig,
    exclude_set: GlobSet,
}

impl LocalSource {
    pub fn new(config: LocalSourceConfig) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.clone());
        let exclude_set = build_globset(&excludes)?;
        Ok(Self {
            config,
            exclude_set,
        })
    }
}

#[async_trait]
impl RecordSource for LocalSource {
    fn label(&self) -> String {
        format!("local:{}", self.config.root.display())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn enumerate(&self, _window: Option<&TimeWindow>) -> Result<Vec<CandidateRecord>> {
        let config = self.config.clone();
        let exclude_set = self.exclude_set.clone();
        tokio::task::spawn_blocking(move || scan(&config, &exclude_set)).await?
    }
}

fn scan(config: &LocalSourceConfig, exclude_set: &GlobSet) -> Result<Vec<CandidateRecord>> {
    let root = &config.root;
    if !root.is_dir() {
        bail!("Local source root is not a directory: {}", root.display());
    }

    let mut records = Vec::new();
    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();
        if exclude_set.is_match(rel_str.as_ref()) {
            continue;
        }

        let Some(identifier) = file_identifier(root, path, &config.suffix) else {
            continue;
        };

        match read_record(path, identifier) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable file"),
        }
    }

    debug!(root = %root.display(), count = records.len(), "local scan complete");
    Ok(records)
}

/// Dedup identifier for a file under `root`: its `/`-separated path
/// relative to `root`, with `suffix` and then any trailing `.vcon` removed.
/// `None` when the name does not end in `suffix`.
pub fn file_identifier(root: &Path, path: &Path, suffix: &str) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    object_identifier(&segments.join("/"), suffix)
}

/// Same rule as [`file_identifier`], applied to an object key relative to
/// the source prefix. Directory segments are kept, so equal names in
/// different partitions never share an identifier.
pub fn object_identifier(key: &str, suffix: &str) -> Option<String> {
    let stem = key.trim_start_matches('/').strip_suffix(suffix)?;
    let stem = stem.strip_suffix(".vcon").unwrap_or(stem);
    let name = stem.rsplit('/').next().unwrap_or(stem);
    if name.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

fn read_record(path: &Path, identifier: String) -> Result<CandidateRecord> {
    let metadata = std::fs::metadata(path)?;
    let last_modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let content = std::fs::read_to_string(path)?;

    Ok(CandidateRecord {
        identifier,
        source_location: format!("file://{}", path.display()),
        last_modified,
        content,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

//! Extension seams of the ingestion pipeline.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ RecordSource │──▶│   Ingestor   │──▶│  VconStore   │
//! │  Local / S3  │   │ normalize +  │   │   (SQLite)   │
//! └──────────────┘   │ batch/retry  │   └──────────────┘
//!                    └──────┬───────┘
//!                           ▼
//!                    ┌──────────────┐
//!                    │ DedupTracker │
//!                    │ Redis / File │
//!                    └──────────────┘
//! ```
//!
//! Each seam is an `async_trait` object so tests can swap in in-memory
//! fakes and the CLI can pick concrete backends at startup.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{CandidateRecord, TimeWindow, Vcon};

/// Where candidate records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A directory tree. Cannot list by modification window.
    Local,
    /// An object store with date-partitioned keys.
    Remote,
}

/// Enumerates candidate records, fetching their content along the way.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Label used in logs and the run summary (e.g. `"s3:archive"`).
    fn label(&self) -> String;

    fn kind(&self) -> SourceKind;

    /// List and fetch candidates. `window` narrows remote listings; local
    /// sources ignore it. Output order is unspecified.
    ///
    /// Individual objects that cannot be read are logged and skipped. An
    /// error means the source itself could not be listed.
    async fn enumerate(&self, window: Option<&TimeWindow>) -> Result<Vec<CandidateRecord>>;
}

/// The relational store vCons are loaded into.
#[async_trait]
pub trait VconStore: Send + Sync {
    /// Insert a vCon and all of its sub-entries. Fails with
    /// [`StoreError::Duplicate`] when the uuid is already present.
    async fn insert_vcon(&self, vcon: &Vcon, source_location: &str) -> Result<(), StoreError>;

    /// Derive `vcons.tags` from each vCon's `tags` attachment where it is not
    /// yet set. Returns the number of vCons updated.
    async fn populate_tags(&self) -> Result<u64, StoreError>;
}

/// Set of identifiers already ingested.
///
/// `has` and `add` never fail: backend errors are logged and treated as
/// "not present", leaving the store's uniqueness constraint as the backstop.
#[async_trait]
pub trait DedupTracker: Send + Sync {
    /// Backend name for logs (`"redis"`, `"file"`, `"disabled"`).
    fn backend(&self) -> &'static str;

    async fn has(&self, id: &str) -> bool;

    /// After this returns, `has(id)` is true for the rest of the run.
    async fn add(&self, id: &str);

    async fn cardinality(&self) -> usize;

    /// Flush any local state. Called once at shutdown.
    async fn close(&self) -> Result<()>;
}

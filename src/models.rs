//! Core data models used throughout vcon-sync.
//!
//! These types represent the candidate records, vCon documents, and run
//! statistics that flow through the ingestion pipeline.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ErrorKind, RecordError};

/// The schema version every ingested vCon is pinned to.
pub const CURRENT_VCON_VERSION: &str = "0.3.0";

/// A unit of source data considered for ingestion in one run.
///
/// Remote sources fetch the object while listing, so `content` is always
/// populated by the time a record reaches the pipeline.
#[derive(Debug, Clone)]
pub struct CandidateRecord {
    /// Dedup key: the object key or file path relative to the source root.
    pub identifier: String,
    /// `s3://bucket/key` or `file:///path`.
    pub source_location: String,
    pub last_modified: DateTime<Utc>,
    pub content: String,
}

/// Half-open time range `[start, end)` used to select recently changed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn last_hours(hours: u32, now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::hours(i64::from(hours)),
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Calendar days (UTC) touched by the window, oldest first.
    pub fn days(&self) -> Vec<NaiveDate> {
        let first = self.start.date_naive();
        let last = self.end.date_naive();
        first.iter_days().take_while(|d| *d <= last).collect()
    }
}

/// A parsed but not yet normalized vCon document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument(pub Value);

impl RawDocument {
    pub fn parse(content: &str) -> Result<Self, RecordError> {
        serde_json::from_str(content)
            .map(RawDocument)
            .map_err(RecordError::Parse)
    }
}

/// A document after migration to the current schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDocument {
    pub value: Value,
    /// True when normalization rewrote anything.
    pub migrated: bool,
}

impl NormalizedDocument {
    pub fn version(&self) -> Option<&str> {
        self.value.get("vcon").and_then(Value::as_str)
    }

    /// Deserialize into the typed shape the store accepts.
    ///
    /// This is where malformed documents the normalizer passed through are
    /// rejected: a missing `uuid`, a body that is still not a string, or an
    /// encoding outside the fixed enumeration.
    pub fn to_vcon(&self) -> Result<Vcon, RecordError> {
        let vcon = Vcon::deserialize(&self.value)
            .map_err(|e| RecordError::Validation(e.to_string()))?;
        if vcon.uuid.trim().is_empty() {
            return Err(RecordError::Validation("vCon uuid is empty".to_string()));
        }
        Ok(vcon)
    }
}

/// Body encodings accepted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Encoding {
    #[serde(rename = "base64url")]
    Base64Url,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "none")]
    None,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Base64Url => "base64url",
            Encoding::Json => "json",
            Encoding::None => "none",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Vcon {
    pub vcon: String,
    pub uuid: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub extensions: Option<Value>,
    #[serde(default)]
    pub must_support: Option<Value>,
    #[serde(default)]
    pub redacted: Option<Value>,
    #[serde(default)]
    pub appended: Option<Value>,
    #[serde(default)]
    pub parties: Vec<Party>,
    #[serde(default)]
    pub dialog: Vec<Dialog>,
    #[serde(default)]
    pub analysis: Vec<Analysis>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Party {
    pub tel: Option<String>,
    pub sip: Option<String>,
    pub stir: Option<String>,
    pub mailto: Option<String>,
    pub name: Option<String>,
    pub did: Option<String>,
    pub uuid: Option<String>,
    pub validation: Option<String>,
    pub jcard: Option<Value>,
    pub gmlpos: Option<String>,
    pub civicaddress: Option<Value>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dialog {
    #[serde(rename = "type")]
    pub kind: String,
    pub start: Option<String>,
    pub duration: Option<f64>,
    pub parties: Option<Value>,
    pub originator: Option<i64>,
    pub mediatype: Option<String>,
    pub filename: Option<String>,
    pub body: Option<String>,
    pub encoding: Option<Encoding>,
    pub url: Option<String>,
    pub content_hash: Option<Value>,
    pub disposition: Option<String>,
    pub session_id: Option<Value>,
    pub application: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Analysis {
    #[serde(rename = "type")]
    pub kind: String,
    /// A single dialog index or an array of them.
    pub dialog: Option<Value>,
    pub mediatype: Option<String>,
    pub filename: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub schema: Option<String>,
    pub body: Option<String>,
    pub encoding: Option<Encoding>,
    pub url: Option<String>,
    pub content_hash: Option<Value>,
}

impl Analysis {
    /// Dialog references as an array, whatever shape the document used.
    pub fn dialog_indices(&self) -> Option<Value> {
        match &self.dialog {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(Value::Array(items.clone())),
            Some(single) => Some(Value::Array(vec![single.clone()])),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub start: Option<String>,
    pub party: Option<i64>,
    pub dialog: Option<i64>,
    pub mediatype: Option<String>,
    pub filename: Option<String>,
    pub body: Option<String>,
    pub encoding: Option<Encoding>,
    pub url: Option<String>,
    pub content_hash: Option<Value>,
}

/// A per-record failure kept for the end-of-run report.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub identifier: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Why a record was skipped rather than written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The dedup tracker already knew the identifier.
    AlreadyTracked,
    /// The store rejected the write as a duplicate identifier.
    DuplicateOnWrite,
}

/// What happened to one candidate record.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Ingested { migrated: bool },
    Skipped(SkipReason),
    Failed(RecordFailure),
}

/// Outcome counts for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub succeeded: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<RecordFailure>,
}

impl BatchResult {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Ingested { migrated } => {
                self.succeeded += 1;
                if migrated {
                    self.migrated += 1;
                }
            }
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.succeeded + self.skipped + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run-level totals, merged from [`BatchResult`]s at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    /// Candidates handed to the scheduler.
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<RecordFailure>,
    /// Set when shutdown stopped the run before every group was dispatched.
    pub cancelled: bool,
}

impl LoadStats {
    pub fn merge(&mut self, batch: BatchResult) {
        self.processed += batch.len();
        self.succeeded += batch.succeeded;
        self.migrated += batch.migrated;
        self.skipped += batch.skipped;
        self.failed += batch.failed;
        self.failures.extend(batch.failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn window_days_span_midnight() {
        let window = TimeWindow {
            start: Utc.with_ymd_and_hms(2024, 6, 14, 22, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 16, 1, 0, 0).unwrap(),
        };
        let days: Vec<String> = window.days().iter().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2024-06-14", "2024-06-15", "2024-06-16"]);
    }

    #[test]
    fn window_is_half_open() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let window = TimeWindow::last_hours(2, now);
        assert!(window.contains(now - Duration::hours(2)));
        assert!(window.contains(now - Duration::minutes(1)));
        assert!(!window.contains(now));
    }

    #[test]
    fn analysis_dialog_single_index_becomes_array() {
        let analysis: Analysis =
            serde_json::from_value(json!({"type": "summary", "dialog": 0})).unwrap();
        assert_eq!(analysis.dialog_indices(), Some(json!([0])));

        let analysis: Analysis =
            serde_json::from_value(json!({"type": "summary", "dialog": [0, 2]})).unwrap();
        assert_eq!(analysis.dialog_indices(), Some(json!([0, 2])));
    }

    #[test]
    fn to_vcon_rejects_unknown_encoding() {
        let doc = NormalizedDocument {
            value: json!({
                "vcon": CURRENT_VCON_VERSION,
                "uuid": "abc",
                "dialog": [{"type": "text", "body": "hi", "encoding": "rot13"}]
            }),
            migrated: false,
        };
        let err = doc.to_vcon().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn to_vcon_requires_uuid() {
        let doc = NormalizedDocument {
            value: json!({"vcon": CURRENT_VCON_VERSION}),
            migrated: false,
        };
        assert!(doc.to_vcon().is_err());
    }
}

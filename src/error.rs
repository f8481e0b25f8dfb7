//! Typed failures for the record pipeline and the relational store.
//!
//! Fatal startup errors travel as `anyhow::Error`; everything here stays
//! inside the per-record worker and ends up in the run summary.

use std::fmt;

use thiserror::Error;

/// Errors from the relational store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The identifier is already present. The message carries the
    /// duplicate-key marker the retry classifier looks for.
    #[error("duplicate key value violates unique constraint on vcons.uuid: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that fail a single record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("write failed after {attempts} attempt(s): {detail}")]
    Write { attempts: u32, detail: String },
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::Parse(_) => ErrorKind::Parse,
            RecordError::Validation(_) => ErrorKind::Validation,
            RecordError::Write { .. } => ErrorKind::Write,
        }
    }
}

/// Coarse failure grouping used by the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Parse,
    Validation,
    Write,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Write => write!(f, "write"),
        }
    }
}

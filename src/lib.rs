//! # vcon-sync
//!
//! Bulk ingestion and continuous sync of vCon conversation records into a
//! relational store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ RecordSource │──▶│  Normalizer  │──▶│    Batch     │──▶│  SQLite  │
//! │  Local / S3  │   │ legacy → 0.3 │   │ retry + skip │   │  store   │
//! └──────────────┘   └──────────────┘   └──────┬───────┘   └──────────┘
//!                                              │
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │ DedupTracker │
//!                                       │ Redis / File │
//!                                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vcon-sync init                  # create database
//! vcon-sync sync ./exports        # load a local directory
//! vcon-sync sync --hours 6        # load recent S3 partitions
//! vcon-sync sync --continuous     # keep syncing until Ctrl-C
//! vcon-sync stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Candidate records, vCon types, run statistics |
//! | [`error`] | Typed store and record errors |
//! | [`traits`] | Source, store and dedup seams |
//! | [`connector_fs`] | Local directory source |
//! | [`connector_s3`] | Date-partitioned S3 source |
//! | [`normalize`] | Legacy document migration |
//! | [`dedup`] | Redis, file and disabled dedup trackers |
//! | [`retry`] | Failure classification and backoff |
//! | [`batch`] | Batch and group scheduler |
//! | [`ingest`] | Per-record pipeline and the `sync` command |
//! | [`sync_loop`] | Continuous sync cycles |
//! | [`progress`] | Progress reporting on stderr |
//! | [`sqlite_store`] | SQLite vCon store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Store statistics |

pub mod batch;
pub mod config;
pub mod connector_fs;
pub mod connector_s3;
pub mod db;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod retry;
pub mod sqlite_store;
pub mod stats;
pub mod sync_loop;
pub mod traits;

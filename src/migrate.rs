//! Relational schema for ingested vCons.
//!
//! One `vcons` row per document, keyed by a generated id and unique on
//! `uuid`, with one child table per sub-array. Child rows keep their array
//! position (`*_index`) so documents can be reassembled in order.

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vcons (
        id TEXT PRIMARY KEY,
        uuid TEXT NOT NULL UNIQUE,
        vcon_version TEXT NOT NULL,
        subject TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        extensions TEXT,
        must_support TEXT,
        redacted TEXT NOT NULL DEFAULT '{}',
        appended TEXT NOT NULL DEFAULT '{}',
        tags TEXT,
        source_location TEXT,
        ingested_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parties (
        vcon_id TEXT NOT NULL REFERENCES vcons(id) ON DELETE CASCADE,
        party_index INTEGER NOT NULL,
        tel TEXT,
        sip TEXT,
        stir TEXT,
        mailto TEXT,
        name TEXT,
        did TEXT,
        uuid TEXT,
        validation TEXT,
        jcard TEXT,
        gmlpos TEXT,
        civicaddress TEXT,
        timezone TEXT,
        PRIMARY KEY (vcon_id, party_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dialog (
        vcon_id TEXT NOT NULL REFERENCES vcons(id) ON DELETE CASCADE,
        dialog_index INTEGER NOT NULL,
        type TEXT NOT NULL,
        start_time TEXT,
        duration_seconds REAL,
        parties TEXT,
        originator INTEGER,
        mediatype TEXT,
        filename TEXT,
        body TEXT,
        encoding TEXT,
        url TEXT,
        content_hash TEXT,
        disposition TEXT,
        session_id TEXT,
        application TEXT,
        message_id TEXT,
        PRIMARY KEY (vcon_id, dialog_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis (
        vcon_id TEXT NOT NULL REFERENCES vcons(id) ON DELETE CASCADE,
        analysis_index INTEGER NOT NULL,
        type TEXT NOT NULL,
        dialog_indices TEXT,
        mediatype TEXT,
        filename TEXT,
        vendor TEXT,
        product TEXT,
        "schema" TEXT,
        body TEXT,
        encoding TEXT,
        url TEXT,
        content_hash TEXT,
        PRIMARY KEY (vcon_id, analysis_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attachments (
        vcon_id TEXT NOT NULL REFERENCES vcons(id) ON DELETE CASCADE,
        attachment_index INTEGER NOT NULL,
        type TEXT,
        start_time TEXT,
        party INTEGER,
        dialog INTEGER,
        mimetype TEXT,
        filename TEXT,
        body TEXT,
        encoding TEXT,
        url TEXT,
        content_hash TEXT,
        PRIMARY KEY (vcon_id, attachment_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vcons_created_at ON vcons(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_vcons_ingested_at ON vcons(ingested_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_type ON attachments(type)",
];

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

//! SQLite-backed [`VconStore`] implementation.
//!
//! Each vCon is written in one transaction: the `vcons` row first (whose
//! UNIQUE `uuid` column is what makes writes idempotent), then one row per
//! party, dialog, analysis and attachment entry.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Analysis, Attachment, Dialog, Encoding, Party, Vcon};
use crate::traits::VconStore;

/// SQLite implementation of the [`VconStore`] trait.
pub struct SqliteVconStore {
    pool: SqlitePool,
}

impl SqliteVconStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn json_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

fn encoding_text(encoding: Option<Encoding>) -> Option<&'static str> {
    encoding.as_ref().map(Encoding::as_str)
}

#[async_trait]
impl VconStore for SqliteVconStore {
    async fn insert_vcon(&self, vcon: &Vcon, source_location: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let vcon_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = vcon.created_at.clone().unwrap_or_else(|| now.to_rfc3339());
        let updated_at = vcon.updated_at.clone().unwrap_or_else(|| created_at.clone());

        let inserted = sqlx::query(
            r#"
            INSERT INTO vcons (id, uuid, vcon_version, subject, created_at, updated_at,
                               extensions, must_support, redacted, appended,
                               source_location, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vcon_id)
        .bind(&vcon.uuid)
        .bind(&vcon.vcon)
        .bind(&vcon.subject)
        .bind(&created_at)
        .bind(&updated_at)
        .bind(json_text(&vcon.extensions))
        .bind(json_text(&vcon.must_support))
        .bind(json_text(&vcon.redacted).unwrap_or_else(|| "{}".to_string()))
        .bind(json_text(&vcon.appended).unwrap_or_else(|| "{}".to_string()))
        .bind(source_location)
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await;

        match inserted {
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::Duplicate(vcon.uuid.clone()));
            }
            other => {
                other?;
            }
        }

        for (idx, party) in vcon.parties.iter().enumerate() {
            insert_party(&mut tx, &vcon_id, idx as i64, party).await?;
        }
        for (idx, dialog) in vcon.dialog.iter().enumerate() {
            insert_dialog(&mut tx, &vcon_id, idx as i64, dialog).await?;
        }
        for (idx, analysis) in vcon.analysis.iter().enumerate() {
            insert_analysis(&mut tx, &vcon_id, idx as i64, analysis).await?;
        }
        for (idx, attachment) in vcon.attachments.iter().enumerate() {
            insert_attachment(&mut tx, &vcon_id, idx as i64, attachment).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn populate_tags(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE vcons SET tags = (
                SELECT a.body FROM attachments a
                WHERE a.vcon_id = vcons.id AND a.type = 'tags' AND a.body IS NOT NULL
                ORDER BY a.attachment_index
                LIMIT 1
            )
            WHERE tags IS NULL
              AND EXISTS (
                SELECT 1 FROM attachments a
                WHERE a.vcon_id = vcons.id AND a.type = 'tags' AND a.body IS NOT NULL
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

async fn insert_party(
    tx: &mut Transaction<'_, Sqlite>,
    vcon_id: &str,
    idx: i64,
    party: &Party,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO parties (vcon_id, party_index, tel, sip, stir, mailto, name, did, uuid,
                             validation, jcard, gmlpos, civicaddress, timezone)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(vcon_id)
    .bind(idx)
    .bind(&party.tel)
    .bind(&party.sip)
    .bind(&party.stir)
    .bind(&party.mailto)
    .bind(&party.name)
    .bind(&party.did)
    .bind(&party.uuid)
    .bind(&party.validation)
    .bind(json_text(&party.jcard))
    .bind(&party.gmlpos)
    .bind(json_text(&party.civicaddress))
    .bind(&party.timezone)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_dialog(
    tx: &mut Transaction<'_, Sqlite>,
    vcon_id: &str,
    idx: i64,
    dialog: &Dialog,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO dialog (vcon_id, dialog_index, type, start_time, duration_seconds, parties,
                            originator, mediatype, filename, body, encoding, url, content_hash,
                            disposition, session_id, application, message_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(vcon_id)
    .bind(idx)
    .bind(&dialog.kind)
    .bind(&dialog.start)
    .bind(dialog.duration)
    .bind(json_text(&dialog.parties))
    .bind(dialog.originator)
    .bind(&dialog.mediatype)
    .bind(&dialog.filename)
    .bind(&dialog.body)
    .bind(encoding_text(dialog.encoding))
    .bind(&dialog.url)
    .bind(json_text(&dialog.content_hash))
    .bind(&dialog.disposition)
    .bind(json_text(&dialog.session_id))
    .bind(&dialog.application)
    .bind(&dialog.message_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_analysis(
    tx: &mut Transaction<'_, Sqlite>,
    vcon_id: &str,
    idx: i64,
    analysis: &Analysis,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO analysis (vcon_id, analysis_index, type, dialog_indices, mediatype, filename,
                              vendor, product, "schema", body, encoding, url, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(vcon_id)
    .bind(idx)
    .bind(&analysis.kind)
    .bind(json_text(&analysis.dialog_indices()))
    .bind(&analysis.mediatype)
    .bind(&analysis.filename)
    .bind(&analysis.vendor)
    .bind(&analysis.product)
    .bind(&analysis.schema)
    .bind(&analysis.body)
    .bind(encoding_text(analysis.encoding))
    .bind(&analysis.url)
    .bind(json_text(&analysis.content_hash))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_attachment(
    tx: &mut Transaction<'_, Sqlite>,
    vcon_id: &str,
    idx: i64,
    attachment: &Attachment,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO attachments (vcon_id, attachment_index, type, start_time, party, dialog,
                                 mimetype, filename, body, encoding, url, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(vcon_id)
    .bind(idx)
    .bind(&attachment.kind)
    .bind(&attachment.start)
    .bind(attachment.party)
    .bind(attachment.dialog)
    .bind(&attachment.mediatype)
    .bind(&attachment.filename)
    .bind(&attachment.body)
    .bind(encoding_text(attachment.encoding))
    .bind(&attachment.url)
    .bind(json_text(&attachment.content_hash))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

//! Database statistics.
//!
//! Quick summary of what has been loaded: vCon and sub-entry counts, how
//! many vCons carry tags, and when the last ingestion happened. Used by
//! `vcon-sync stats` to confirm that syncs are landing.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Row counts gathered by [`collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub vcons: i64,
    pub parties: i64,
    pub dialog: i64,
    pub analysis: i64,
    pub attachments: i64,
    pub tagged: i64,
    pub last_ingested_at: Option<i64>,
}

const COUNTED_TABLES: &[&str] = &["vcons", "parties", "dialog", "analysis", "attachments"];

pub async fn collect(pool: &SqlitePool) -> Result<StoreStats> {
    let mut counts = Vec::with_capacity(COUNTED_TABLES.len());
    for table in COUNTED_TABLES {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        counts.push(n);
    }

    let tagged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vcons WHERE tags IS NOT NULL")
        .fetch_one(pool)
        .await?;
    let last_ingested_at: Option<i64> = sqlx::query_scalar("SELECT MAX(ingested_at) FROM vcons")
        .fetch_one(pool)
        .await?;

    Ok(StoreStats {
        vcons: counts[0],
        parties: counts[1],
        dialog: counts[2],
        analysis: counts[3],
        attachments: counts[4],
        tagged,
        last_ingested_at,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("vcon-sync: Store Stats");
    println!("=======================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  vCons:        {}", stats.vcons);
    println!("  Parties:      {}", stats.parties);
    println!("  Dialog:       {}", stats.dialog);
    println!("  Analysis:     {}", stats.analysis);
    println!("  Attachments:  {}", stats.attachments);
    println!(
        "  Tagged:       {} / {} ({}%)",
        stats.tagged,
        stats.vcons,
        if stats.vcons > 0 {
            (stats.tagged * 100) / stats.vcons
        } else {
            0
        }
    );
    println!(
        "  Last ingest:  {}",
        stats
            .last_ingested_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::migrate;
    use crate::models::Vcon;
    use crate::sqlite_store::SqliteVconStore;
    use crate::traits::VconStore;
    use tempfile::TempDir;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_timestamps() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }

    #[tokio::test]
    async fn collects_counts() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&DbConfig {
            path: tmp.path().join("s.sqlite"),
        })
        .await
        .unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        assert_eq!(collect(&pool).await.unwrap(), StoreStats::default());

        let store = SqliteVconStore::new(pool.clone());
        let vcon: Vcon = serde_json::from_value(serde_json::json!({
            "vcon": "0.3.0",
            "uuid": "u-1",
            "parties": [{"name": "A"}],
            "attachments": [{"type": "tags", "body": "[]", "encoding": "json"}]
        }))
        .unwrap();
        store.insert_vcon(&vcon, "x").await.unwrap();
        store.populate_tags().await.unwrap();

        let stats = collect(&pool).await.unwrap();
        assert_eq!(stats.vcons, 1);
        assert_eq!(stats.parties, 1);
        assert_eq!(stats.attachments, 1);
        assert_eq!(stats.tagged, 1);
        assert!(stats.last_ingested_at.is_some());
    }
}

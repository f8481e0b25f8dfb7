//! Deduplication tracker backends.
//!
//! [`init`] picks one [`DedupTracker`] implementation at startup:
//!
//! - [`RedisDedup`]: a shared Redis set, mirrored into a local cache that
//!   is filled at startup and updated on every `add`. A local miss is
//!   re-checked against Redis to catch identifiers added by other processes.
//! - [`FileDedup`]: a private set seeded from a JSON snapshot on disk and
//!   rewritten every `persist_every` additions and at shutdown. Used when
//!   Redis is not configured or unreachable at startup.
//! - [`DisabledDedup`]: never reports membership (`--no-dedup`).
//!
//! The snapshot file is meant for a single process; concurrent writers to
//! the same path are not supported.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;
use crate::traits::DedupTracker;

/// Select and initialise the dedup backend described by `config`.
pub async fn init(config: &DedupConfig) -> Box<dyn DedupTracker> {
    if !config.enabled {
        info!("dedup tracking disabled");
        return Box::new(DisabledDedup);
    }

    if let Some(url) = &config.redis_url {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        match RedisDedup::connect(url, &config.set_key, timeout).await {
            Ok(tracker) => {
                info!(
                    set_key = %config.set_key,
                    cached = tracker.cache().len(),
                    "dedup tracker using redis set"
                );
                return Box::new(tracker);
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable, falling back to local dedup snapshot");
            }
        }
    }

    let tracker = FileDedup::open(&config.snapshot_path, config.persist_every).await;
    info!(
        snapshot = %config.snapshot_path.display(),
        seeded = tracker.state().ids.len(),
        "dedup tracker using local snapshot"
    );
    Box::new(tracker)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============ Redis ============

pub struct RedisDedup {
    conn: ConnectionManager,
    set_key: String,
    cache: Mutex<HashSet<String>>,
}

impl RedisDedup {
    pub async fn connect(url: &str, set_key: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .context("timed out connecting to redis")?
            .context("failed to connect to redis")?;

        let members = tokio::time::timeout(timeout, conn.smembers::<_, Vec<String>>(set_key))
            .await
            .context("timed out loading dedup set")?
            .context("failed to load dedup set")?;

        Ok(Self {
            conn,
            set_key: set_key.to_string(),
            cache: Mutex::new(members.into_iter().collect()),
        })
    }

    fn cache(&self) -> MutexGuard<'_, HashSet<String>> {
        lock(&self.cache)
    }
}

#[async_trait]
impl DedupTracker for RedisDedup {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn has(&self, id: &str) -> bool {
        if self.cache().contains(id) {
            return true;
        }

        let mut conn = self.conn.clone();
        match conn.sismember::<_, _, bool>(&self.set_key, id).await {
            Ok(true) => {
                debug!(id, "dedup hit from shared set");
                self.cache().insert(id.to_string());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(id, error = %e, "redis membership check failed, assuming not ingested");
                false
            }
        }
    }

    async fn add(&self, id: &str) {
        self.cache().insert(id.to_string());

        let mut conn = self.conn.clone();
        if let Err(e) = conn.sadd::<_, _, ()>(&self.set_key, id).await {
            warn!(id, error = %e, "failed to add identifier to redis set");
        }
    }

    async fn cardinality(&self) -> usize {
        let mut conn = self.conn.clone();
        match conn.scard::<_, usize>(&self.set_key).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "redis SCARD failed, reporting local cache size");
                self.cache().len()
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============ Local snapshot ============

struct FileState {
    ids: HashSet<String>,
    since_persist: usize,
}

pub struct FileDedup {
    path: PathBuf,
    persist_every: usize,
    state: Mutex<FileState>,
}

impl FileDedup {
    /// Open the tracker, seeding it from `path` when a snapshot exists.
    /// An unreadable or corrupt snapshot is logged and ignored.
    pub async fn open(path: &Path, persist_every: usize) -> Self {
        let ids = match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt dedup snapshot");
                    HashSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read dedup snapshot");
                HashSet::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            persist_every: persist_every.max(1),
            state: Mutex::new(FileState {
                ids,
                since_persist: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        lock(&self.state)
    }

    fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    async fn persist(&self, ids: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(ids)?)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = ids.len(), "dedup snapshot written");
        Ok(())
    }
}

#[async_trait]
impl DedupTracker for FileDedup {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn has(&self, id: &str) -> bool {
        self.state().ids.contains(id)
    }

    async fn add(&self, id: &str) {
        let due = {
            let mut state = self.state();
            if !state.ids.insert(id.to_string()) {
                return;
            }
            state.since_persist += 1;
            if state.since_persist >= self.persist_every {
                state.since_persist = 0;
                true
            } else {
                false
            }
        };

        if due {
            let ids = self.snapshot();
            if let Err(e) = self.persist(&ids).await {
                warn!(error = %e, "failed to persist dedup snapshot");
            }
        }
    }

    async fn cardinality(&self) -> usize {
        self.state().ids.len()
    }

    async fn close(&self) -> Result<()> {
        let ids = self.snapshot();
        self.persist(&ids).await
    }
}

// ============ Disabled ============

pub struct DisabledDedup;

#[async_trait]
impl DedupTracker for DisabledDedup {
    fn backend(&self) -> &'static str {
        "disabled"
    }

    async fn has(&self, _id: &str) -> bool {
        false
    }

    async fn add(&self, _id: &str) {}

    async fn cardinality(&self) -> usize {
        0
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> DedupConfig {
        DedupConfig {
            snapshot_path: dir.path().join("dedup.json"),
            persist_every: 2,
            ..DedupConfig::default()
        }
    }

    fn read_snapshot(path: &Path) -> Vec<String> {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn add_then_has() {
        let tmp = TempDir::new().unwrap();
        let tracker = FileDedup::open(&tmp.path().join("d.json"), 1000).await;
        assert!(!tracker.has("a").await);
        tracker.add("a").await;
        assert!(tracker.has("a").await);
        assert_eq!(tracker.cardinality().await, 1);
    }

    #[tokio::test]
    async fn persists_every_n_additions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("d.json");
        let tracker = FileDedup::open(&path, 2).await;

        tracker.add("a").await;
        assert!(!path.exists());
        tracker.add("a").await;
        assert!(!path.exists(), "re-adding a known id is not an addition");
        tracker.add("b").await;
        assert_eq!(read_snapshot(&path), vec!["a", "b"]);

        tracker.add("c").await;
        assert_eq!(read_snapshot(&path).len(), 2);
        tracker.close().await.unwrap();
        assert_eq!(read_snapshot(&path), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn seeds_from_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("d.json");
        std::fs::write(&path, r#"["x","y"]"#).unwrap();

        let tracker = FileDedup::open(&path, 1000).await;
        assert!(tracker.has("x").await);
        assert!(tracker.has("y").await);
        assert!(!tracker.has("z").await);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("d.json");
        std::fs::write(&path, "{not json").unwrap();
        let tracker = FileDedup::open(&path, 1000).await;
        assert_eq!(tracker.cardinality().await, 0);
    }

    #[tokio::test]
    async fn init_without_redis_uses_file() {
        let tmp = TempDir::new().unwrap();
        let tracker = init(&config_in(&tmp)).await;
        assert_eq!(tracker.backend(), "file");
    }

    #[tokio::test]
    async fn init_disabled() {
        let tmp = TempDir::new().unwrap();
        let config = DedupConfig {
            enabled: false,
            ..config_in(&tmp)
        };
        let tracker = init(&config).await;
        assert_eq!(tracker.backend(), "disabled");
        tracker.add("a").await;
        assert!(!tracker.has("a").await);
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_file() {
        let tmp = TempDir::new().unwrap();
        let config = DedupConfig {
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            connect_timeout_secs: 1,
            ..config_in(&tmp)
        };
        let tracker = init(&config).await;
        assert_eq!(tracker.backend(), "file");
    }

    // ============ Redis (live server) ============

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_key(tag: &str) -> String {
        format!("vcon-sync-test:{}:{}", tag, uuid::Uuid::new_v4())
    }

    async fn raw_conn() -> ConnectionManager {
        ConnectionManager::new(redis::Client::open(redis_url()).unwrap())
            .await
            .unwrap()
    }

    async fn connect(key: &str) -> RedisDedup {
        RedisDedup::connect(&redis_url(), key, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn redis_cache_is_filled_at_startup() {
        let key = unique_key("startup");
        let mut raw = raw_conn().await;
        raw.sadd::<_, _, ()>(&key, vec!["a", "b"]).await.unwrap();

        let tracker = connect(&key).await;
        assert!(tracker.cache().contains("a"));
        assert!(tracker.cache().contains("b"));
        assert!(tracker.has("a").await);
        assert!(!tracker.has("c").await);
        assert_eq!(tracker.cardinality().await, 2);

        raw.del::<_, ()>(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn redis_sees_ids_added_by_another_client() {
        let key = unique_key("shared");
        let mut raw = raw_conn().await;
        let tracker = connect(&key).await;
        assert!(!tracker.has("x").await);

        raw.sadd::<_, _, ()>(&key, "x").await.unwrap();
        assert!(tracker.has("x").await);
        assert!(tracker.cache().contains("x"));

        // gone from the set, still answered by the cache
        raw.del::<_, ()>(&key).await.unwrap();
        assert!(tracker.has("x").await);
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn redis_add_updates_cache_and_set() {
        let key = unique_key("add");
        let mut raw = raw_conn().await;
        let tracker = connect(&key).await;

        tracker.add("y").await;
        tracker.add("z").await;
        tracker.add("y").await;
        assert!(tracker.cache().contains("y"));
        assert!(raw.sismember::<_, _, bool>(&key, "y").await.unwrap());
        assert_eq!(tracker.cardinality().await, 2);
        tracker.close().await.unwrap();

        raw.del::<_, ()>(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn init_prefers_reachable_redis() {
        let tmp = TempDir::new().unwrap();
        let key = unique_key("init");
        let config = DedupConfig {
            redis_url: Some(redis_url()),
            set_key: key.clone(),
            ..config_in(&tmp)
        };
        let tracker = init(&config).await;
        assert_eq!(tracker.backend(), "redis");
        tracker.add("a").await;

        let mut raw = raw_conn().await;
        assert!(raw.sismember::<_, _, bool>(&key, "a").await.unwrap());
        raw.del::<_, ()>(&key).await.unwrap();
    }
}

//! Durable key-value store contract and implementations.
//!
//! The engine consumes the store through the narrow [`KeyValueStore`] trait:
//! string keys, string values, TTL on write, and a ping for health checks.
//! Store failures are ordinary errors here; the caching layer above decides
//! to degrade rather than propagate them.
//!
//! Two implementations ship: [`FileStore`] persists one JSON file per key
//! under an advisory-locked directory, and [`MemoryStore`] backs tests and
//! environments without a writable data dir.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const STORE_LOCK_TIMEOUT_SECS: u64 = 5;
const STORE_LOCK_RETRY_MS: u64 = 50;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Narrow contract over a durable key-value store with per-entry expiry.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>>;
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>>;
    fn ping<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry_from_ttl(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// File-per-key store with fs2 advisory locking and atomic writes.
///
/// Entries carry their expiry timestamp and are dropped lazily on read;
/// `sweep` removes expired files eagerly.
pub struct FileStore {
    root: PathBuf,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key(key)))
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StoreLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.root.exists() {
            return Err(anyhow::anyhow!("store directory missing"));
        }

        let lock_path = self.root.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for store lock ({}s)",
                            STORE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    fn get_sync(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = self.lock(false)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: StoredEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("dropping unreadable store entry {}: {}", path.display(), err);
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };
        if entry.expired(Utc::now()) {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn put_sync(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let entry = StoredEntry {
            value,
            expires_at: expiry_from_ttl(ttl),
        };
        let content = serde_json::to_string(&entry)?;
        write_atomic(&self.entry_path(key), &content)?;
        Ok(())
    }

    fn delete_sync(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(false);
        }
        let _lock = self.lock(true)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn ping_sync(&self) -> anyhow::Result<()> {
        // Taking the lock exercises both directory creation and writability.
        let _lock = self.lock(true)?;
        Ok(())
    }

    /// Remove every expired entry file. Entry expiry is otherwise lazy.
    pub fn sweep(&self) -> anyhow::Result<usize> {
        let _lock = self.lock(true)?;
        let now = Utc::now();
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let expired = match serde_json::from_str::<StoredEntry>(&content) {
                Ok(entry) => entry.expired(now),
                // Unparseable entries are garbage from an older layout.
                Err(_) => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move { self.get_sync(key) })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.put_sync(key, value, ttl) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move { self.delete_sync(key) })
    }

    fn ping<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.ping_sync() })
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// HashMap-backed store with the same contract. Entries still honor TTL so
/// expiry behavior is testable without a filesystem.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            if let Some(entry) = entries.get(key) {
                if entry.expired(now) {
                    entries.remove(key);
                    return Ok(None);
                }
                return Ok(Some(entry.value.clone()));
            }
            Ok(None)
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                key.to_string(),
                StoredEntry {
                    value,
                    expires_at: expiry_from_ttl(ttl),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            Ok(entries.remove(key).is_some())
        })
    }

    fn ping<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .put("patchlight:review:abc", "{\"x\":1}".to_string(), TTL)
            .await
            .unwrap();
        let value = store.get("patchlight:review:abc").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"x\":1}"));
    }

    #[tokio::test]
    async fn test_file_store_expired_entry_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .put("k", "v".to_string(), Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.put("k", "v".to_string(), TTL).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_sweep_removes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .put("dead", "v".to_string(), Duration::from_secs(0))
            .await
            .unwrap();
        store.put("live", "v".to_string(), TTL).await.unwrap();
        let removed = store.sweep().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_file_store_ping_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));
        store.ping().await.unwrap();
        assert!(dir.path().join("nested").exists());
    }

    #[test]
    fn test_sanitize_key_flattens_separators() {
        assert_eq!(
            sanitize_key("patchlight:dedup:ab/cd"),
            "patchlight_dedup_ab_cd"
        );
    }

    #[tokio::test]
    async fn test_memory_store_honors_ttl() {
        let store = MemoryStore::new();
        store
            .put("k", "v".to_string(), Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.put("k", "v".to_string(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_memory_store_overwrite_resets_value() {
        let store = MemoryStore::new();
        store.put("k", "one".to_string(), TTL).await.unwrap();
        store.put("k", "two".to_string(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);
    }
}

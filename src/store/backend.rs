//! Storage backends for [`PersistentStore`](super::PersistentStore).
//!
//! Backends are fallible and dumb: they load, save, and sweep
//! [`CacheEntry`] records. Freshness decisions and error swallowing live
//! in the store facade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use super::CacheEntry;
use crate::{MimirError, Result};

/// Default maximum number of entries held by [`MemoryBackend`].
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Current on-disk format version for [`FileBackend`].
const FILE_FORMAT_VERSION: u32 = 1;

/// Durable key-value storage for cache entries.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Load the entry for `key`, expired or not.
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Write `entry`, replacing any previous entry with the same key.
    async fn save(&self, entry: CacheEntry) -> Result<()>;

    /// Delete every entry with `expires_at < now_ms`. Returns how many.
    async fn remove_expired(&self, now_ms: u64) -> Result<usize>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Process-lifetime backend on a bounded moka cache.
///
/// No moka TTL is configured: expired entries must stay readable as stale
/// data until swept. Once the capacity bound is reached, moka's TinyLFU
/// policy decides which keys are admitted and which are evicted.
pub struct MemoryBackend {
    entries: Cache<String, CacheEntry>,
}

impl MemoryBackend {
    /// Create a backend with the default capacity.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a backend with a custom capacity.
    pub fn with_max_entries(max: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max).build(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.get(key).await)
    }

    async fn save(&self, entry: CacheEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at < now_ms)
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.entries.invalidate(key.as_str()).await;
        }
        Ok(expired.len())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Versioned payload wrapper for the on-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Durable backend: the whole namespace in a single JSON file.
///
/// The file is read once on open and rewritten atomically (tmp + rename)
/// on every change. Writes are serialised by a lock held across the disk
/// write, so for a given key the last completed write wins.
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileBackend {
    /// Open (or lazily create) the store file at `path`.
    ///
    /// A missing file opens empty. An unreadable or corrupt file also opens
    /// empty with a warning; it is replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_file(&path).await;
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MimirError::Store(format!(
                    "failed to create store dir {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let file = StoreFile {
            version: FILE_FORMAT_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await.map_err(|e| {
            MimirError::Store(format!(
                "failed to write store file {}: {e}",
                tmp_path.display()
            ))
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            MimirError::Store(format!(
                "failed to rename store file {} → {}: {e}",
                tmp_path.display(),
                self.path.display()
            ))
        })
    }
}

async fn load_file(path: &Path) -> HashMap<String, CacheEntry> {
    let content = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read store file");
            return HashMap::new();
        }
    };
    match serde_json::from_slice::<StoreFile>(&content) {
        Ok(file) if file.version <= FILE_FORMAT_VERSION => file
            .entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect(),
        Ok(file) => {
            warn!(
                path = %path.display(),
                version = file.version,
                "unsupported store file version, starting empty"
            );
            HashMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt store file, starting empty");
            HashMap::new()
        }
    }
}

#[async_trait]
impl StoreBackend for FileBackend {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn save(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.key.clone(), entry);
        self.persist(&entries).await
    }

    async fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now_ms);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }
}

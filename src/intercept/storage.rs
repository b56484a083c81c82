//! Named response stores.
//!
//! Each store maps a request fingerprint to the last good response. Stores
//! are capacity-bounded moka caches and are optionally written through to
//! one JSON file per store under a directory, so they survive restarts.
//! Whole stores are the unit of deletion, which is how old versions are
//! purged.
//!
//! File rewrites happen on a snapshot taken under a per-store write lock,
//! never under the lock guarding the set of stores, so reads do not wait on
//! disk I/O. Bodies are base64-encoded on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::policy::DEFAULT_MAX_ENTRIES;
use crate::transport::HttpResponse;
use crate::{MimirError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    responses: HashMap<String, StoredResponse>,
}

/// On-disk form of a response.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl From<&HttpResponse> for StoredResponse {
    fn from(response: &HttpResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
        }
    }
}

impl TryFrom<StoredResponse> for HttpResponse {
    type Error = base64::DecodeError;

    fn try_from(stored: StoredResponse) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            status: stored.status,
            headers: stored.headers,
            body: BASE64.decode(stored.body)?,
        })
    }
}

/// One named store.
#[derive(Clone)]
struct Store {
    responses: Cache<String, HttpResponse>,
    /// Serialises rewrites of this store's file.
    file: Arc<Mutex<()>>,
}

impl Store {
    fn new(max_entries: u64) -> Self {
        Self {
            responses: Cache::builder().max_capacity(max_entries).build(),
            file: Arc::new(Mutex::new(())),
        }
    }

    fn is(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.file, &other.file)
    }

    async fn snapshot(&self) -> StoreFile {
        self.responses.run_pending_tasks().await;
        StoreFile {
            responses: self
                .responses
                .iter()
                .map(|(fingerprint, response)| {
                    (fingerprint.to_string(), StoredResponse::from(&response))
                })
                .collect(),
        }
    }
}

/// A set of named response stores.
pub struct ResponseStorage {
    dir: Option<PathBuf>,
    max_entries: u64,
    stores: RwLock<HashMap<String, Store>>,
}

impl ResponseStorage {
    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::in_memory_with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// In-memory storage holding at most `max_entries` responses per store.
    pub fn in_memory_with_max_entries(max_entries: u64) -> Self {
        Self {
            dir: None,
            max_entries,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Open storage persisted under `dir`, loading every existing store.
    ///
    /// Unreadable store files are skipped with a warning.
    pub async fn open(dir: impl Into<PathBuf>) -> Self {
        Self::open_with_max_entries(dir, DEFAULT_MAX_ENTRIES).await
    }

    /// Like [`open`](Self::open), bounding each store to `max_entries`.
    pub async fn open_with_max_entries(dir: impl Into<PathBuf>, max_entries: u64) -> Self {
        let dir = dir.into();
        let stores = load_dir(&dir, max_entries).await;
        Self {
            dir: Some(dir),
            max_entries,
            stores: RwLock::new(stores),
        }
    }

    async fn existing(&self, store: &str) -> Option<Store> {
        self.stores.read().await.get(store).cloned()
    }

    /// Cached response for `fingerprint` in `store`.
    pub async fn get(&self, store: &str, fingerprint: &str) -> Option<HttpResponse> {
        self.existing(store).await?.responses.get(fingerprint).await
    }

    /// Whether `store` holds a response for `fingerprint`.
    pub async fn contains(&self, store: &str, fingerprint: &str) -> bool {
        self.existing(store)
            .await
            .is_some_and(|s| s.responses.contains_key(fingerprint))
    }

    /// Number of responses held in `store`.
    pub async fn entry_count(&self, store: &str) -> u64 {
        let Some(store) = self.existing(store).await else {
            return 0;
        };
        store.responses.run_pending_tasks().await;
        store.responses.entry_count()
    }

    /// Store `response`, replacing any previous one for `fingerprint`.
    pub async fn put(&self, store: &str, fingerprint: &str, response: HttpResponse) -> Result<()> {
        let handle = {
            let mut stores = self.stores.write().await;
            stores
                .entry(store.to_string())
                .or_insert_with(|| Store::new(self.max_entries))
                .clone()
        };
        handle
            .responses
            .insert(fingerprint.to_string(), response)
            .await;

        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _file = handle.file.lock().await;
        // Deleted while waiting for the write lock: leave no file behind.
        if !self.existing(store).await.is_some_and(|s| s.is(&handle)) {
            return Ok(());
        }
        let snapshot = handle.snapshot().await;
        persist(dir, store, &snapshot).await
    }

    /// Names of every store currently held, sorted.
    pub async fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete a whole store. Returns whether it existed.
    pub async fn delete_store(&self, store: &str) -> Result<bool> {
        let removed = self.stores.write().await.remove(store);
        let _file = match &removed {
            Some(handle) => {
                handle.responses.invalidate_all();
                Some(handle.file.lock().await)
            }
            None => None,
        };
        if let Some(dir) = &self.dir {
            match tokio::fs::remove_file(store_path(dir, store)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MimirError::Store(format!(
                        "failed to delete response store {store}: {e}"
                    )));
                }
            }
        }
        Ok(removed.is_some())
    }
}

fn store_path(dir: &Path, store: &str) -> PathBuf {
    dir.join(format!("{store}.json"))
}

async fn persist(dir: &Path, store: &str, file: &StoreFile) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        MimirError::Store(format!(
            "failed to create response dir {}: {e}",
            dir.display()
        ))
    })?;
    let json = serde_json::to_vec(file)?;
    let path = store_path(dir, store);
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(|e| MimirError::Store(format!("failed to write {}: {e}", tmp_path.display())))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|e| MimirError::Store(format!("failed to rename {}: {e}", tmp_path.display())))
}

async fn load_dir(dir: &Path, max_entries: u64) -> HashMap<String, Store> {
    let mut stores = HashMap::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return stores,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to read response dir");
            return stores;
        }
    };

    loop {
        let entry = match read_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to list response dir");
                break;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match read_store_file(&path).await {
            Ok(responses) => {
                let store = Store::new(max_entries);
                for (fingerprint, response) in responses {
                    store.responses.insert(fingerprint, response).await;
                }
                stores.insert(name, store);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable response store");
            }
        }
    }
    stores
}

async fn read_store_file(
    path: &Path,
) -> std::result::Result<Vec<(String, HttpResponse)>, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    file.responses
        .into_iter()
        .map(|(fingerprint, stored)| {
            HttpResponse::try_from(stored)
                .map(|response| (fingerprint, response))
                .map_err(|e| e.to_string())
        })
        .collect()
}

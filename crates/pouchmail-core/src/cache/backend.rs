//! Pluggable persistence backends for the record cache
//!
//! Two interchangeable implementations sit behind [`StorageBackend`]: a
//! fast single-file binary store and a durable one-file-per-key JSON store.
//! Which one runs is an explicit configuration choice, never a silent
//! runtime fallback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};

/// Trait for key/value persistence backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the bytes stored under a key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store bytes under a key, replacing any previous value
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate every stored key
    async fn all_keys(&self) -> Result<Vec<String>>;
}

/// Create the backend selected in configuration
pub fn create_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let cache_dir = config.cache_dir();
    match config.cache.backend {
        BackendKind::Binary => Ok(Arc::new(BinaryBackend::open(
            cache_dir.join("records.bin"),
        )?)),
        BackendKind::KeyValue => Ok(Arc::new(KeyValueBackend::open(cache_dir.join("kv"))?)),
    }
}

/// Fast binary store: the whole key space lives in one bincode-framed file,
/// loaded at open and rewritten atomically on every mutation.
pub struct BinaryBackend {
    path: PathBuf,
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl BinaryBackend {
    /// Open (or create) the store file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let bytes = std::fs::read(&path)?;
            match bincode::deserialize(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    // A cache is always rebuildable from the network
                    warn!("Discarding corrupt store file {:?}: {}", path, e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        debug!("Opened binary store {:?} with {} keys", path, map.len());
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    /// Rewrite the store file atomically (temp + rename)
    fn flush(&self) -> Result<()> {
        let bytes = bincode::serialize(&*self.map.read())?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StorageWrite(e.to_string()))?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| Error::StorageWrite(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::StorageWrite(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for BinaryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_vec());
        self.flush()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.map.write().remove(key).is_some();
        if removed {
            self.flush()?;
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.map.read().keys().cloned().collect())
    }
}

/// On-disk envelope for the key/value store
#[derive(Serialize, Deserialize)]
struct KvEntry {
    key: String,
    /// Value bytes, base64-encoded
    value: String,
}

/// Durable key/value store: one JSON file per key. Slower than the binary
/// store but every entry is independently inspectable and recoverable.
pub struct KeyValueBackend {
    dir: PathBuf,
}

impl KeyValueBackend {
    /// Open (or create) the store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Keys are base64url-encoded into filenames so arbitrary key strings
    /// stay bijective with paths.
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }
}

#[async_trait]
impl StorageBackend for KeyValueBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let entry: KvEntry = serde_json::from_str(&contents).map_err(|e| Error::CorruptEntry {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(entry.value.as_bytes())
            .map_err(|e| Error::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(bytes))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let entry = KvEntry {
            key: key.to_string(),
            value: URL_SAFE_NO_PAD.encode(value),
        };
        let json =
            serde_json::to_string(&entry).map_err(|e| Error::StorageWrite(e.to_string()))?;
        std::fs::write(self.entry_path(key), json)
            .map_err(|e| Error::StorageWrite(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    if let Ok(raw) = URL_SAFE_NO_PAD.decode(stem.to_string_lossy().as_bytes()) {
                        if let Ok(key) = String::from_utf8(raw) {
                            keys.push(key);
                            continue;
                        }
                    }
                    warn!("Skipping unrecognized store file {:?}", path);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(backend: &dyn StorageBackend) {
        assert!(backend.get("missing").await.unwrap().is_none());

        backend.set("a", b"alpha").await.unwrap();
        backend.set("b", b"beta").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().unwrap(), b"alpha");

        backend.set("a", b"alpha2").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().unwrap(), b"alpha2");

        let mut keys = backend.all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        backend.delete("a").await.unwrap();
        // Deleting twice is fine
        backend.delete("a").await.unwrap();
        assert!(backend.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BinaryBackend::open(dir.path().join("records.bin")).unwrap();
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn key_value_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = KeyValueBackend::open(dir.path().join("kv")).unwrap();
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn binary_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        {
            let backend = BinaryBackend::open(&path).unwrap();
            backend.set("k", b"v").await.unwrap();
        }
        let reopened = BinaryBackend::open(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().unwrap(), b"v");
    }

    #[tokio::test]
    async fn key_value_backend_handles_hostile_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = KeyValueBackend::open(dir.path().join("kv")).unwrap();
        let key = "pouchmail:All/Mail?*";
        backend.set(key, b"v").await.unwrap();
        assert_eq!(backend.get(key).await.unwrap().unwrap(), b"v");
        assert_eq!(backend.all_keys().await.unwrap(), vec![key]);
    }
}

//! Record cache store
//!
//! Namespaced, TTL-bounded persistence for collections of remote records,
//! keyed by a category label (an email folder/label name). Collections are
//! written as one combined blob so records, the id set and the timestamp
//! can never go out of sync with each other.

mod backend;
mod merge;
mod record;

pub use backend::{create_backend, BinaryBackend, KeyValueBackend, StorageBackend};
pub use merge::merge;
pub use record::{Record, RecordDate};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;

/// Clock returning epoch milliseconds; injectable so TTL tests can advance
/// time without sleeping
pub type Clock = fn() -> i64;

fn wall_clock() -> i64 {
    Utc::now().timestamp_millis()
}

/// One cached collection as stored on disk.
///
/// Invariant: `ids` is exactly the set of `id` fields in `records`; both
/// are derived together at write time and persisted as a single value.
#[derive(Debug, Serialize, Deserialize)]
struct CachedCollection {
    records: Vec<Record>,
    ids: HashSet<String>,
    /// Wall-clock write time, epoch milliseconds
    timestamp: i64,
}

/// TTL-bounded record cache over a pluggable backend
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    ttl_ms: i64,
    clock: Clock,
}

impl RecordStore {
    /// Create a store over a backend using cache configuration
    pub fn new(backend: Arc<dyn StorageBackend>, config: &CacheConfig) -> Self {
        Self::with_clock(backend, config, wall_clock)
    }

    /// Create with an injected clock
    pub fn with_clock(
        backend: Arc<dyn StorageBackend>,
        config: &CacheConfig,
        clock: Clock,
    ) -> Self {
        Self {
            backend,
            namespace: config.namespace.clone(),
            ttl_ms: (config.ttl_hours as i64) * 60 * 60 * 1000,
            clock,
        }
    }

    fn storage_key(&self, category: &str) -> String {
        format!("{}:{}", self.namespace, category)
    }

    /// Read a category's collection blob, downgrading every read-path
    /// failure to a miss so callers can always fall back to the network.
    async fn read_collection(&self, category: &str) -> Option<CachedCollection> {
        let key = self.storage_key(category);
        let bytes = match self.backend.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(collection) => Some(collection),
            Err(e) => {
                warn!("Corrupt cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// Write a category's collection. An empty slice is a valid entry and
    /// distinct from "no entry": it records that the remote had nothing.
    pub async fn put(&self, category: &str, records: &[Record]) -> Result<()> {
        let collection = CachedCollection {
            records: records.to_vec(),
            ids: records.iter().map(|r| r.id.clone()).collect(),
            timestamp: (self.clock)(),
        };
        let bytes = serde_json::to_vec(&collection)?;
        self.backend.set(&self.storage_key(category), &bytes).await?;
        debug!("Cached {} records under {}", records.len(), category);
        Ok(())
    }

    /// Read a category's records. Returns `None` for a missing, corrupt or
    /// TTL-expired entry; callers treat all three as a cold cache.
    pub async fn get(&self, category: &str) -> Option<Vec<Record>> {
        let collection = self.read_collection(category).await?;
        let age_ms = (self.clock)() - collection.timestamp;
        if age_ms > self.ttl_ms {
            debug!(
                "Cache entry for {} expired ({} ms old, ttl {} ms)",
                category, age_ms, self.ttl_ms
            );
            return None;
        }
        Some(collection.records)
    }

    /// Raw last-write time for a category, independent of TTL. Used for
    /// "last updated" display without cache invalidation semantics.
    pub async fn last_write_time(&self, category: &str) -> Option<DateTime<Utc>> {
        let collection = self.read_collection(category).await?;
        Utc.timestamp_millis_opt(collection.timestamp).single()
    }

    /// Membership check against the stored id set only.
    ///
    /// Deliberately skips the TTL: an expired-but-undeleted entry still
    /// answers membership queries. Callers needing TTL-aware membership
    /// must call [`RecordStore::get`] first.
    pub async fn contains(&self, category: &str, id: &str) -> bool {
        self.read_collection(category)
            .await
            .map(|c| c.ids.contains(id))
            .unwrap_or(false)
    }

    /// Remove every entry under this store's namespace, across all
    /// categories, without the caller having to enumerate them.
    pub async fn clear_all(&self) -> Result<()> {
        let prefix = format!("{}:", self.namespace);
        let keys = self.backend.all_keys().await?;
        let mut cleared = 0usize;
        for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
            self.backend.delete(key).await?;
            cleared += 1;
        }
        debug!("Cleared {} cache entries", cleared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicI64, Ordering};

    use crate::config::BackendKind;

    fn test_config() -> CacheConfig {
        CacheConfig {
            backend: BackendKind::Binary,
            ttl_hours: 12,
            namespace: "pouchmail".to_string(),
        }
    }

    fn rec(id: &str, date: &str) -> Record {
        Record::new(id, RecordDate::Text(date.to_string()))
    }

    fn binary_backend(dir: &std::path::Path) -> Arc<dyn StorageBackend> {
        Arc::new(BinaryBackend::open(dir.join("records.bin")).unwrap())
    }

    fn kv_backend(dir: &std::path::Path) -> Arc<dyn StorageBackend> {
        Arc::new(KeyValueBackend::open(dir.join("kv")).unwrap())
    }

    async fn put_get_round_trip(backend: Arc<dyn StorageBackend>) {
        let store = RecordStore::new(backend, &test_config());
        assert!(store.get("Work").await.is_none());

        store
            .put("Work", &[rec("1", "2024-01-01"), rec("2", "2024-02-01")])
            .await
            .unwrap();

        let records = store.get("Work").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(store.contains("Work", "1").await);
        assert!(!store.contains("Work", "9").await);
    }

    #[tokio::test]
    async fn round_trip_binary() {
        let dir = tempfile::tempdir().unwrap();
        put_get_round_trip(binary_backend(dir.path())).await;
    }

    #[tokio::test]
    async fn round_trip_key_value() {
        let dir = tempfile::tempdir().unwrap();
        put_get_round_trip(kv_backend(dir.path())).await;
    }

    static TTL_NOW: AtomicI64 = AtomicI64::new(1_700_000_000_000);

    fn ttl_clock() -> i64 {
        TTL_NOW.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn ttl_expiry_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            RecordStore::with_clock(binary_backend(dir.path()), &test_config(), ttl_clock);

        let write_time = TTL_NOW.load(Ordering::SeqCst);
        store.put("Work", &[rec("1", "2024-01-01")]).await.unwrap();

        // 11h59m later: still fresh
        TTL_NOW.store(write_time + (11 * 60 + 59) * 60 * 1000, Ordering::SeqCst);
        assert!(store.get("Work").await.is_some());

        // 12h + 1ms later: treated as absent
        TTL_NOW.store(write_time + 12 * 60 * 60 * 1000 + 1, Ordering::SeqCst);
        assert!(store.get("Work").await.is_none());

        // last_write_time ignores the TTL
        let written = store.last_write_time("Work").await.unwrap();
        assert_eq!(written.timestamp_millis(), write_time);

        // The ids set still answers membership after expiry (documented quirk)
        assert!(store.contains("Work", "1").await);
    }

    #[tokio::test]
    async fn empty_collection_is_a_valid_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(binary_backend(dir.path()), &test_config());

        store.put("Empty", &[]).await.unwrap();
        let records = store.get("Empty").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn clear_all_spans_categories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = binary_backend(dir.path());
        let store = RecordStore::new(backend.clone(), &test_config());

        store.put("Work", &[rec("1", "2024-01-01")]).await.unwrap();
        store.put("Social", &[rec("2", "2024-01-02")]).await.unwrap();

        // A key outside the namespace survives
        backend.set("other:thing", b"keep").await.unwrap();

        store.clear_all().await.unwrap();
        assert!(store.get("Work").await.is_none());
        assert!(store.get("Social").await.is_none());
        assert_eq!(backend.get("other:thing").await.unwrap().unwrap(), b"keep");
    }

    #[tokio::test]
    async fn corrupt_entry_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let backend = binary_backend(dir.path());
        let store = RecordStore::new(backend.clone(), &test_config());

        backend.set("pouchmail:Bad", b"not json").await.unwrap();
        assert!(store.get("Bad").await.is_none());
        assert!(store.last_write_time("Bad").await.is_none());
    }

    #[tokio::test]
    async fn put_replaces_previous_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(binary_backend(dir.path()), &test_config());

        store.put("Work", &[rec("1", "2024-01-01")]).await.unwrap();
        store.put("Work", &[rec("2", "2024-02-01")]).await.unwrap();

        let records = store.get("Work").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "2");
        assert!(!store.contains("Work", "1").await);
    }
}

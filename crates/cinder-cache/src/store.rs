//! Cache stores.
//!
//! Lookups try the exact key first, then the most specific (longest) restore prefix that
//! matches anything; within that prefix the most recently written entry wins. Writes to
//! one key are last-writer-wins.

use crate::compression::{compress, decompress, extension};
use crate::keys::{checksum, matches_prefix, sanitize_key};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cinder_core::cache::{CacheEntry, CacheEvictionReason, CacheHit, Compression};
use cinder_core::ids::CacheEntryId;
use cinder_core::ports::CacheStore;
use cinder_core::Result;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Bounds enforced by `evict`.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Total stored (compressed) bytes.
    pub max_total_bytes: Option<u64>,
    pub max_entries: Option<usize>,
    /// Entries not read or written for this long expire.
    pub ttl: Option<Duration>,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: Some(10 * 1024 * 1024 * 1024),
            max_entries: None,
            ttl: Some(Duration::days(7)),
        }
    }
}

impl CacheLimits {
    pub fn unlimited() -> Self {
        Self {
            max_total_bytes: None,
            max_entries: None,
            ttl: None,
        }
    }
}

fn select<'a>(
    entries: &[&'a CacheEntry],
    key: &str,
    prefixes: &[String],
) -> Option<(&'a CacheEntry, bool)> {
    if let Some(exact) = entries.iter().find(|e| e.key == key) {
        return Some((*exact, true));
    }
    // Most specific prefix first; equal lengths keep the caller's order.
    let mut ordered: Vec<&String> = prefixes.iter().collect();
    ordered.sort_by(|a, b| b.len().cmp(&a.len()));
    ordered
        .into_iter()
        .find_map(|prefix| {
            entries
                .iter()
                .filter(|e| matches_prefix(&e.key, prefix))
                .max_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.key.cmp(&b.key))
                })
                .copied()
        })
        .map(|entry| (entry, false))
}

/// Keys to drop: expired entries first, then least recently used until within limits.
fn plan_eviction(
    entries: &[&CacheEntry],
    limits: &CacheLimits,
    now: DateTime<Utc>,
) -> Vec<(String, CacheEvictionReason)> {
    let mut evicted = Vec::new();
    let mut live: Vec<&CacheEntry> = Vec::new();
    for &entry in entries {
        if limits
            .ttl
            .is_some_and(|ttl| entry.last_accessed_at + ttl <= now)
        {
            evicted.push((entry.key.clone(), CacheEvictionReason::Expired));
        } else {
            live.push(entry);
        }
    }

    live.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
    let mut count = live.len();
    for entry in live {
        let over_bytes = limits.max_total_bytes.is_some_and(|max| total > max);
        let over_count = limits.max_entries.is_some_and(|max| count > max);
        if !over_bytes && !over_count {
            break;
        }
        total -= entry.size_bytes;
        count -= 1;
        evicted.push((entry.key.clone(), CacheEvictionReason::Capacity));
    }
    evicted
}

fn new_entry(key: &str, blob: &[u8], stored: &[u8], compression: Compression, path: String) -> CacheEntry {
    let now = Utc::now();
    CacheEntry {
        id: CacheEntryId::new(),
        key: key.to_string(),
        size_bytes: stored.len() as u64,
        compression,
        checksum_sha256: checksum(blob),
        storage_path: path,
        created_at: now,
        last_accessed_at: now,
        access_count: 0,
    }
}

fn sorted_newest_first(mut entries: Vec<CacheEntry>, prefix: Option<&str>) -> Vec<CacheEntry> {
    entries.retain(|e| prefix.is_none_or(|p| matches_prefix(&e.key, p)));
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries
}

struct MemoryBlob {
    entry: CacheEntry,
    data: Vec<u8>,
}

/// Process-local cache.
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, MemoryBlob>>,
    compression: Compression,
    limits: CacheLimits,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            compression: Compression::Lz4,
            limits: CacheLimits::unlimited(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_limits(mut self, limits: CacheLimits) -> Self {
        self.limits = limits;
        self
    }

    pub async fn evict(&self, now: DateTime<Utc>) -> Vec<(CacheEntry, CacheEvictionReason)> {
        let mut entries = self.entries.write().await;
        let all: Vec<&CacheEntry> = entries.values().map(|b| &b.entry).collect();
        let plan = plan_eviction(&all, &self.limits, now);
        plan.into_iter()
            .filter_map(|(key, reason)| {
                entries.remove(&key).map(|blob| {
                    debug!(key = %key, ?reason, "Cache entry evicted");
                    (blob.entry, reason)
                })
            })
            .collect()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str, restore_prefixes: &[String]) -> Result<Option<CacheHit>> {
        let mut entries = self.entries.write().await;
        let all: Vec<&CacheEntry> = entries.values().map(|b| &b.entry).collect();
        let Some((found, exact)) = select(&all, key, restore_prefixes) else {
            return Ok(None);
        };
        let found = found.key.clone();

        let Some(stored) = entries.get_mut(&found) else {
            return Ok(None);
        };
        let blob = decompress(&stored.data, stored.entry.compression)?;
        if checksum(&blob) != stored.entry.checksum_sha256 {
            warn!(key = %found, "Cache entry failed checksum, dropping");
            entries.remove(&found);
            return Ok(None);
        }
        stored.entry.last_accessed_at = Utc::now();
        stored.entry.access_count += 1;

        Ok(Some(CacheHit {
            entry: stored.entry.clone(),
            blob,
            exact,
        }))
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<CacheEntry> {
        let data = compress(&blob, self.compression)?;
        let entry = new_entry(key, &blob, &data, self.compression, format!("memory://{key}"));
        self.entries.write().await.insert(
            key.to_string(),
            MemoryBlob {
                entry: entry.clone(),
                data,
            },
        );
        self.evict(Utc::now()).await;
        Ok(entry)
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(sorted_newest_first(
            entries.values().map(|b| b.entry.clone()).collect(),
            prefix,
        ))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

type Index = IndexMap<String, CacheEntry>;

/// Directory-backed cache: compressed blobs under `blobs/` plus an `index.json`.
pub struct FilesystemCacheStore {
    root: PathBuf,
    compression: Compression,
    limits: CacheLimits,
    lock: Mutex<()>,
}

impl FilesystemCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: Compression::Zstd,
            limits: CacheLimits::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_limits(mut self, limits: CacheLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    async fn load_index(&self) -> Result<Index> {
        match tokio::fs::read(self.index_path()).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => Ok(index),
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Cache index unreadable, starting empty");
                    Ok(Index::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_index(&self, index: &Index) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join("index.json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(index)?).await?;
        tokio::fs::rename(&tmp, self.index_path()).await?;
        Ok(())
    }

    async fn remove_blob(&self, entry: &CacheEntry) {
        if let Err(e) = tokio::fs::remove_file(self.root.join(&entry.storage_path)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(key = %entry.key, error = %e, "Failed to remove cache blob");
        }
    }

    async fn evict_locked(
        &self,
        index: &mut Index,
        now: DateTime<Utc>,
    ) -> Vec<(CacheEntry, CacheEvictionReason)> {
        let all: Vec<&CacheEntry> = index.values().collect();
        let plan = plan_eviction(&all, &self.limits, now);
        let mut evicted = Vec::new();
        for (key, reason) in plan {
            if let Some(entry) = index.shift_remove(&key) {
                self.remove_blob(&entry).await;
                info!(key = %key, ?reason, size = entry.size_bytes, "Cache entry evicted");
                evicted.push((entry, reason));
            }
        }
        evicted
    }

    /// Drop expired entries and trim to the configured limits.
    pub async fn evict(&self, now: DateTime<Utc>) -> Result<Vec<(CacheEntry, CacheEvictionReason)>> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        let evicted = self.evict_locked(&mut index, now).await;
        if !evicted.is_empty() {
            self.store_index(&index).await?;
        }
        Ok(evicted)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<Vec<CacheEntry>> {
        let _guard = self.lock.lock().await;
        let index = self.load_index().await?;
        for entry in index.values() {
            self.remove_blob(entry).await;
        }
        self.store_index(&Index::new()).await?;
        Ok(index.into_values().collect())
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn get(&self, key: &str, restore_prefixes: &[String]) -> Result<Option<CacheHit>> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        let all: Vec<&CacheEntry> = index.values().collect();
        let Some((found, exact)) = select(&all, key, restore_prefixes) else {
            return Ok(None);
        };
        let found = found.clone();

        let data = match tokio::fs::read(self.root.join(&found.storage_path)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %found.key, "Cache blob missing, dropping entry");
                index.shift_remove(&found.key);
                self.store_index(&index).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let blob = match decompress(&data, found.compression) {
            Ok(blob) if checksum(&blob) == found.checksum_sha256 => blob,
            _ => {
                warn!(key = %found.key, "Cache entry corrupt, dropping");
                if let Some(entry) = index.shift_remove(&found.key) {
                    self.remove_blob(&entry).await;
                }
                self.store_index(&index).await?;
                return Ok(None);
            }
        };

        let entry = match index.get_mut(&found.key) {
            Some(entry) => {
                entry.last_accessed_at = Utc::now();
                entry.access_count += 1;
                entry.clone()
            }
            None => found,
        };
        self.store_index(&index).await?;

        Ok(Some(CacheHit { entry, blob, exact }))
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<CacheEntry> {
        let _guard = self.lock.lock().await;
        let data = compress(&blob, self.compression)?;

        let relative = format!("blobs/{}.{}", sanitize_key(key), extension(self.compression));
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let entry = new_entry(key, &blob, &data, self.compression, relative);
        let mut index = self.load_index().await?;
        if let Some(previous) = index.insert(key.to_string(), entry.clone())
            && previous.storage_path != entry.storage_path
        {
            self.remove_blob(&previous).await;
        }
        self.evict_locked(&mut index, Utc::now()).await;
        self.store_index(&index).await?;

        debug!(key, size = entry.size_bytes, "Cache entry written");
        Ok(entry)
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>> {
        let _guard = self.lock.lock().await;
        let index = self.load_index().await?;
        Ok(sorted_newest_first(index.into_values().collect(), prefix))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut index = self.load_index().await?;
        if let Some(entry) = index.shift_remove(key) {
            self.remove_blob(&entry).await;
            self.store_index(&index).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(entries: &[CacheEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_exact_prefix_and_miss() {
        let store = MemoryCacheStore::new();
        store.put("deps-linux-aaa", b"old".to_vec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put("deps-linux-bbb", b"new".to_vec()).await.unwrap();

        let exact = store.get("deps-linux-aaa", &[]).await.unwrap().unwrap();
        assert!(exact.exact);
        assert_eq!(exact.blob, b"old");

        let prefixes = vec!["deps-macos-".to_string(), "deps-linux-".to_string()];
        let prefix = store.get("deps-linux-ccc", &prefixes).await.unwrap().unwrap();
        assert!(!prefix.exact);
        assert_eq!(prefix.entry.key, "deps-linux-bbb");

        assert!(store.get("deps-windows", &["deps-win".into()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_most_specific_prefix_beats_newer_entry() {
        let store = MemoryCacheStore::new();
        store.put("deps-linux-1", b"linux".to_vec()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put("deps-mac-1", b"mac".to_vec()).await.unwrap();

        let prefixes = vec!["deps-".to_string(), "deps-linux-".to_string()];
        let hit = store.get("deps-linux-2", &prefixes).await.unwrap().unwrap();
        assert_eq!(hit.entry.key, "deps-linux-1");
        assert_eq!(hit.blob, b"linux");

        // Only the broad prefix matches: newest wins.
        let hit = store.get("deps-win-2", &["deps-win-".into(), "deps-".into()]).await.unwrap().unwrap();
        assert_eq!(hit.entry.key, "deps-mac-1");
    }

    #[tokio::test]
    async fn test_memory_capacity_eviction_is_lru() {
        let store = MemoryCacheStore::new()
            .with_compression(Compression::None)
            .with_limits(CacheLimits {
                max_entries: Some(2),
                ..CacheLimits::unlimited()
            });
        store.put("a", vec![1]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put("b", vec![2]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.get("a", &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put("c", vec![3]).await.unwrap();

        let mut remaining = keys(&store.list(None).await.unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        remaining.sort();
        assert_eq!(remaining, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_filesystem_store_persists_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCacheStore::new(dir.path());
        store.put("cargo-abc", b"registry".to_vec()).await.unwrap();

        let reopened = FilesystemCacheStore::new(dir.path());
        let hit = reopened.get("cargo-abc", &[]).await.unwrap().unwrap();
        assert_eq!(hit.blob, b"registry");
        assert_eq!(hit.entry.access_count, 1);
        assert_eq!(keys(&reopened.list(Some("cargo-")).await.unwrap()), vec!["cargo-abc"]);

        let evicted = reopened.evict(Utc::now() + Duration::days(8)).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, CacheEvictionReason::Expired);
        assert!(reopened.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCacheStore::new(dir.path()).with_compression(Compression::None);
        let entry = store.put("k", b"payload".to_vec()).await.unwrap();
        std::fs::write(dir.path().join(&entry.storage_path), b"tampered").unwrap();

        assert!(store.get("k", &[]).await.unwrap().is_none());
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCacheStore::new(dir.path());
        store.put("k", b"one".to_vec()).await.unwrap();
        store.put("k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 1);
        assert_eq!(store.get("k", &[]).await.unwrap().unwrap().blob, b"two");
        store.delete("k").await.unwrap();
        assert!(store.get("k", &[]).await.unwrap().is_none());
    }
}

//! Artifact stores.
//!
//! Artifact names are unique within a run. Expired artifacts are invisible to `get` and
//! `list` and are deleted by `purge_expired`.

use crate::compression::{compress, decompress, extension};
use crate::keys::sanitize_key;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cinder_core::cache::{Artifact, ArtifactUpload, Compression};
use cinder_core::ids::{ArtifactId, RunId};
use cinder_core::ports::{ArtifactStore, StoredArtifact};
use cinder_core::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

fn describe(run_id: RunId, upload: &ArtifactUpload) -> Artifact {
    let now = Utc::now();
    Artifact {
        id: ArtifactId::new(),
        name: upload.name.clone(),
        run_id,
        producer: upload.producer.clone(),
        paths: upload.paths.clone(),
        size_bytes: upload.blob.len() as u64,
        created_at: now,
        retention_deadline: now + Duration::days(i64::from(upload.retention_days)),
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    runs: RwLock<HashMap<RunId, IndexMap<String, StoredArtifact>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, run_id: RunId, upload: ArtifactUpload) -> Result<Artifact> {
        let mut runs = self.runs.write().await;
        let artifacts = runs.entry(run_id).or_default();
        if artifacts.contains_key(&upload.name) {
            return Err(Error::ArtifactConflict(upload.name));
        }
        let artifact = describe(run_id, &upload);
        artifacts.insert(
            upload.name,
            StoredArtifact {
                artifact: artifact.clone(),
                blob: upload.blob,
            },
        );
        Ok(artifact)
    }

    async fn get(&self, run_id: RunId, name: &str) -> Result<Option<StoredArtifact>> {
        let now = Utc::now();
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .and_then(|artifacts| artifacts.get(name))
            .filter(|stored| !stored.artifact.is_expired(now))
            .cloned())
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let now = Utc::now();
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|artifacts| {
                artifacts
                    .values()
                    .filter(|stored| !stored.artifact.is_expired(now))
                    .map(|stored| stored.artifact.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let mut runs = self.runs.write().await;
        let mut purged = Vec::new();
        for artifacts in runs.values_mut() {
            artifacts.retain(|_, stored| {
                let expired = stored.artifact.is_expired(now);
                if expired {
                    purged.push(stored.artifact.clone());
                }
                !expired
            });
        }
        runs.retain(|_, artifacts| !artifacts.is_empty());
        Ok(purged)
    }
}

/// Stores `<root>/<run id>/<name>.json` metadata next to the compressed archive.
pub struct FilesystemArtifactStore {
    root: PathBuf,
    compression: Compression,
    lock: Mutex<()>,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compression: Compression::Zstd,
            lock: Mutex::new(()),
        }
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn meta_path(&self, run_id: RunId, name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.json", sanitize_key(name)))
    }

    fn blob_path(&self, run_id: RunId, name: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("{}.{}", sanitize_key(name), extension(self.compression)))
    }

    async fn read_meta(&self, path: &PathBuf) -> Result<Option<Artifact>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ArtifactStore(e.to_string())),
        }
    }

    async fn metas_in(&self, dir: &PathBuf) -> Result<Vec<(PathBuf, Artifact)>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::ArtifactStore(e.to_string())),
        };
        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_meta(&path).await {
                Ok(Some(artifact)) => metas.push((path, artifact)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable artifact metadata"),
            }
        }
        metas.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        Ok(metas)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(&self, run_id: RunId, upload: ArtifactUpload) -> Result<Artifact> {
        let _guard = self.lock.lock().await;
        let meta = self.meta_path(run_id, &upload.name);
        if tokio::fs::try_exists(&meta).await? {
            return Err(Error::ArtifactConflict(upload.name));
        }
        tokio::fs::create_dir_all(self.run_dir(run_id)).await?;

        let artifact = describe(run_id, &upload);
        let data = compress(&upload.blob, self.compression)?;
        tokio::fs::write(self.blob_path(run_id, &upload.name), data).await?;
        tokio::fs::write(&meta, serde_json::to_vec_pretty(&artifact)?).await?;

        info!(run_id = %run_id, artifact = %artifact.name, size = artifact.size_bytes, "Artifact stored");
        Ok(artifact)
    }

    async fn get(&self, run_id: RunId, name: &str) -> Result<Option<StoredArtifact>> {
        let Some(artifact) = self.read_meta(&self.meta_path(run_id, name)).await? else {
            return Ok(None);
        };
        if artifact.is_expired(Utc::now()) {
            return Ok(None);
        }
        let data = tokio::fs::read(self.blob_path(run_id, name))
            .await
            .map_err(|e| Error::ArtifactStore(format!("blob for '{name}' unreadable: {e}")))?;
        let blob = decompress(&data, self.compression)?;
        Ok(Some(StoredArtifact { artifact, blob }))
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<Artifact>> {
        let now = Utc::now();
        Ok(self
            .metas_in(&self.run_dir(run_id))
            .await?
            .into_iter()
            .map(|(_, artifact)| artifact)
            .filter(|artifact| !artifact.is_expired(now))
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let _guard = self.lock.lock().await;
        let mut runs = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut purged = Vec::new();
        while let Some(run) = runs.next_entry().await? {
            let dir = run.path();
            if !dir.is_dir() {
                continue;
            }
            for (meta, artifact) in self.metas_in(&dir).await? {
                if !artifact.is_expired(now) {
                    continue;
                }
                tokio::fs::remove_file(self.blob_path(artifact.run_id, &artifact.name))
                    .await
                    .ok();
                tokio::fs::remove_file(&meta).await?;
                info!(run_id = %artifact.run_id, artifact = %artifact.name, "Artifact expired");
                purged.push(artifact);
            }
            // Only succeeds once the directory is empty.
            tokio::fs::remove_dir(&dir).await.ok();
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::ids::InstanceId;

    fn upload(name: &str, retention_days: u32) -> ArtifactUpload {
        ArtifactUpload {
            name: name.into(),
            producer: InstanceId::new("build"),
            paths: vec!["dist/".into()],
            retention_days,
            blob: b"archive".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_names_are_unique_per_run() {
        let store = MemoryArtifactStore::new();
        let run = RunId::new();
        store.put(run, upload("dist", 30)).await.unwrap();
        let err = store.put(run, upload("dist", 30)).await.unwrap_err();
        assert!(matches!(err, Error::ArtifactConflict(name) if name == "dist"));

        // Another run may reuse the name.
        store.put(RunId::new(), upload("dist", 30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_purge_expired() {
        let store = MemoryArtifactStore::new();
        let run = RunId::new();
        store.put(run, upload("short", 1)).await.unwrap();
        store.put(run, upload("long", 90)).await.unwrap();

        let purged = store.purge_expired(Utc::now() + Duration::days(2)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].name, "short");
        assert!(store.get(run, "short").await.unwrap().is_none());
        assert_eq!(store.list(run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let run = RunId::new();

        let artifact = store.put(run, upload("dist", 1)).await.unwrap();
        assert_eq!(artifact.producer, InstanceId::new("build"));

        let stored = store.get(run, "dist").await.unwrap().unwrap();
        assert_eq!(stored.blob, b"archive");
        assert!(store.get(run, "other").await.unwrap().is_none());
        assert!(matches!(
            store.put(run, upload("dist", 1)).await,
            Err(Error::ArtifactConflict(_))
        ));

        let purged = store.purge_expired(Utc::now() + Duration::days(2)).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(store.list(run).await.unwrap().is_empty());
        assert!(!dir.path().join(run.to_string()).exists());
    }
}

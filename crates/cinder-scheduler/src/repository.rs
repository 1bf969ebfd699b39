//! Run record repositories.

use async_trait::async_trait;
use cinder_core::ids::RunId;
use cinder_core::ports::RunRepository;
use cinder_core::run::RunRecord;
use cinder_core::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

/// Keeps records for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        self.runs.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(runs)
    }
}

/// One pretty-printed JSON file per run, named `<run id>.json`.
pub struct JsonFileRunRepository {
    dir: PathBuf,
}

impl JsonFileRunRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: RunId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl RunRepository for JsonFileRunRepository {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(record)?;
        let path = self.path(record.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<RunRecord>> {
        match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(record) => runs.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(runs)
    }
}

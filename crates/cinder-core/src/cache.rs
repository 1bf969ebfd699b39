//! Cache and artifact types.

use crate::ids::{ArtifactId, CacheEntryId, InstanceId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: CacheEntryId,
    pub key: String,
    pub size_bytes: u64,
    pub compression: Compression,
    pub checksum_sha256: String,
    /// Where the blob lives, as understood by the store that wrote it.
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
    #[default]
    Zstd,
    Lz4,
    None,
}

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    /// Uncompressed archive bytes.
    pub blob: Vec<u8>,
    /// The exact key matched, as opposed to a restore prefix.
    pub exact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEvictionReason {
    Expired,
    Capacity,
    Manual,
}

/// A published artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: String,
    pub run_id: RunId,
    pub producer: InstanceId,
    pub paths: Vec<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
}

impl Artifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_deadline <= now
    }
}

/// Request to publish an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub name: String,
    pub producer: InstanceId,
    pub paths: Vec<String>,
    pub retention_days: u32,
    /// Archive bytes produced by the step runner.
    pub blob: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_artifact_expiry() {
        let now = Utc::now();
        let artifact = Artifact {
            id: ArtifactId::new(),
            name: "dist".into(),
            run_id: RunId::new(),
            producer: InstanceId::new("build"),
            paths: vec!["dist/".into()],
            size_bytes: 10,
            created_at: now,
            retention_deadline: now + Duration::days(1),
        };
        assert!(!artifact.is_expired(now));
        assert!(artifact.is_expired(now + Duration::days(2)));
    }
}

//! Persistence seam for memory snapshots.

use crate::error::{MemoryError, Result};
use crate::memory::types::MemorySnapshot;
use async_trait::async_trait;
use std::path::PathBuf;

/// Snapshot persistence collaborator. The on-disk format belongs to the
/// implementation, not to the store.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn save(&self, snapshot: &MemorySnapshot) -> Result<()>;

    /// `Ok(None)` when no snapshot exists yet.
    async fn load(&self) -> Result<Option<MemorySnapshot>>;

    /// Periodic secondary copy, fired by the store every N mutations.
    async fn backup(&self, snapshot: &MemorySnapshot) -> Result<()>;
}

/// Pretty-printed JSON snapshot on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf, backup_path: PathBuf) -> Self {
        Self { path, backup_path }
    }

    async fn write_atomic(path: &PathBuf, snapshot: &MemorySnapshot) -> std::result::Result<(), String> {
        let encoded =
            serde_json::to_string_pretty(snapshot).map_err(|error| error.to_string())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, encoded.as_bytes())
            .await
            .map_err(|error| error.to_string())?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|error| error.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for JsonFileStore {
    async fn save(&self, snapshot: &MemorySnapshot) -> Result<()> {
        Self::write_atomic(&self.path, snapshot)
            .await
            .map_err(MemoryError::Save)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<MemorySnapshot>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(MemoryError::Load(error.to_string()).into()),
        };
        let snapshot =
            serde_json::from_str(&raw).map_err(|error| MemoryError::Load(error.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn backup(&self, snapshot: &MemorySnapshot) -> Result<()> {
        Self::write_atomic(&self.backup_path, snapshot)
            .await
            .map_err(MemoryError::Backup)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::StoredMessage;

    #[tokio::test]
    async fn round_trips_a_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(
            dir.path().join("memory.json"),
            dir.path().join("memory.backup.json"),
        );

        assert!(store.load().await.expect("empty load").is_none());

        let mut snapshot = MemorySnapshot::default();
        snapshot
            .channels
            .insert("0:0".into(), vec![StoredMessage::new(1, "user", "hello")]);
        store.save(&snapshot).await.expect("save");

        let loaded = store.load().await.expect("load").expect("snapshot exists");
        assert_eq!(loaded.channels["0:0"][0].text, "hello");

        store.backup(&snapshot).await.expect("backup");
        assert!(dir.path().join("memory.backup.json").exists());
    }
}

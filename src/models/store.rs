use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{ContainerRecord, WorkspaceId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt record for workspace {0}: {1}")]
    Corrupt(WorkspaceId, String),
}

/// Record store for the container fields of each workspace.
///
/// `load` returns a default (`not_created`) record for unknown ids.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn load(&self, id: WorkspaceId) -> Result<ContainerRecord, StoreError>;
    async fn save(&self, id: WorkspaceId, record: &ContainerRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryWorkspaceStore {
    records: Mutex<HashMap<WorkspaceId, ContainerRecord>>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn load(&self, id: WorkspaceId) -> Result<ContainerRecord, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned().unwrap_or_default())
    }

    async fn save(&self, id: WorkspaceId, record: &ContainerRecord) -> Result<(), StoreError> {
        self.records.lock().await.insert(id, record.clone());
        Ok(())
    }
}

/// JSON file holding every record, rewritten on each save.
pub struct FileWorkspaceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileWorkspaceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/workspace-orchestrator/records.json`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("workspace-orchestrator"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("records.json")
    }

    async fn read_all(&self) -> Result<HashMap<WorkspaceId, ContainerRecord>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WorkspaceStore for FileWorkspaceStore {
    async fn load(&self, id: WorkspaceId) -> Result<ContainerRecord, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(&id).unwrap_or_default())
    }

    async fn save(&self, id: WorkspaceId, record: &ContainerRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.insert(id, record.clone());

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&records)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerStatus;

    #[tokio::test]
    async fn unknown_workspace_loads_as_not_created() {
        let store = MemoryWorkspaceStore::new();
        let record = store.load(42).await.unwrap();
        assert_eq!(record.status, ContainerStatus::NotCreated);
        assert!(record.container_id.is_none());
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.json");

        let mut record = ContainerRecord::default();
        record.container_id = Some("abc123".to_string());
        record.port = Some(8007);
        record.mark_running();

        FileWorkspaceStore::new(&path).save(7, &record).await.unwrap();
        FileWorkspaceStore::new(&path).save(8, &ContainerRecord::default()).await.unwrap();

        let reopened = FileWorkspaceStore::new(&path);
        assert_eq!(reopened.load(7).await.unwrap(), record);
        assert_eq!(reopened.load(8).await.unwrap().status, ContainerStatus::NotCreated);
    }
}

//! JSON-file backed [`StateStore`].
//!
//! Layout: `<root>/deployments/<deployment-id>.json`, one document per
//! deployment. Every mutation rewrites the document atomically (temp file in
//! the same directory, then rename), so a crash mid-write leaves the previous
//! state intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::storage_traits::*;

/// Filesystem-backed deployment state store.
pub struct FileStateStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a store rooted at `root`. Creates `root/deployments/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("deployments");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, deployment: &DeploymentId) -> StorageResult<PathBuf> {
        deployment.validate()?;
        Ok(self.dir.join(format!("{}.json", deployment.as_str())))
    }

    fn read(&self, deployment: &DeploymentId) -> StorageResult<DeploymentState> {
        let path = self.path_for(deployment)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(DeploymentState::empty(deployment))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, deployment: &DeploymentId, state: &DeploymentState) -> StorageResult<()> {
        let path = self.path_for(deployment)?;
        let bytes = serde_json::to_vec_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(deployment = %deployment, path = %path.display(), "state persisted");
        Ok(())
    }

    fn mutate<T>(
        &self,
        deployment: &DeploymentId,
        f: impl FnOnce(&mut DeploymentState) -> T,
    ) -> StorageResult<T> {
        let _guard = self.write_lock.lock().unwrap();
        let mut state = self.read(deployment)?;
        let out = f(&mut state);
        self.write(deployment, &state)?;
        Ok(out)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, deployment: &DeploymentId) -> StorageResult<DeploymentState> {
        self.read(deployment)
    }

    async fn init_token(
        &self,
        deployment: &DeploymentId,
        candidate: &str,
    ) -> StorageResult<String> {
        self.mutate(deployment, |state| {
            state
                .uniqueness_token
                .get_or_insert_with(|| candidate.to_string())
                .clone()
        })
    }

    async fn put_resource(
        &self,
        deployment: &DeploymentId,
        record: ResourceRecord,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.resources.insert(record.address.clone(), record);
        })
    }

    async fn remove_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.resources.remove(address);
        })
    }

    async fn get_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<Option<CustomResourceRecord>> {
        Ok(self.read(deployment)?.custom_resources.remove(address))
    }

    async fn put_custom_resource(
        &self,
        deployment: &DeploymentId,
        record: CustomResourceRecord,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state
                .custom_resources
                .insert(record.address.clone(), record);
        })
    }

    async fn remove_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.custom_resources.remove(address);
        })
    }

    async fn publish_outputs(
        &self,
        deployment: &DeploymentId,
        group: &str,
        outputs: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.outputs.insert(group.to_string(), outputs);
        })
    }

    async fn retract_outputs(&self, deployment: &DeploymentId, group: &str) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.outputs.remove(group);
        })
    }

    async fn list_deployments(&self) -> StorageResult<Vec<DeploymentId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(DeploymentId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FileStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_deployment_loads_empty() {
        let (_dir, store) = make_store();
        let state = store.load(&DeploymentId::new("nope")).await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.deployment_id, "nope");
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let (dir, store) = make_store();
        let id = DeploymentId::new("dash");
        store.init_token(&id, "abc123def0").await.unwrap();
        drop(store);

        let reopened = FileStateStore::new(dir.path()).unwrap();
        let state = reopened.load(&id).await.unwrap();
        assert_eq!(state.uniqueness_token.as_deref(), Some("abc123def0"));
    }

    #[tokio::test]
    async fn rejects_path_like_deployment_ids() {
        let (_dir, store) = make_store();
        let err = store
            .load(&DeploymentId::new("../escape"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::StorageError::InvalidDeploymentId { .. }
        ));
    }
}

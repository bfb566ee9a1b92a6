//! File-system backed flow store.
//!
//! Layout:
//! ```text
//! {base_dir}/automation_flows/{flow_id}.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::FlowStoreError;
use crate::traits::FlowStore;
use crate::types::AutomationFlow;

/// File-system backed store for automation flows.
///
/// Atomic writes use a temp-file-then-rename pattern to prevent
/// partial writes from corrupting the store.
pub struct FileFlowStore {
    flows_dir: PathBuf,
}

impl FileFlowStore {
    /// Create a new `FileFlowStore` rooted at `base_dir`.
    ///
    /// Creates `{base_dir}/automation_flows/` if it doesn't exist.
    pub fn new(base_dir: PathBuf) -> Result<Self, FlowStoreError> {
        let flows_dir = base_dir.join("automation_flows");
        std::fs::create_dir_all(&flows_dir).map_err(|e| FlowStoreError::Store {
            message: format!("failed to create flows directory: {e}"),
        })?;
        Ok(Self { flows_dir })
    }

    fn flow_path(&self, flow_id: &str) -> Result<PathBuf, FlowStoreError> {
        let ok = !flow_id.is_empty()
            && flow_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(FlowStoreError::Store {
                message: format!("invalid flow id: {flow_id:?}"),
            });
        }
        Ok(self.flows_dir.join(format!("{flow_id}.json")))
    }
}

/// Atomic write: serialize to temp file, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FlowStoreError> {
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, data).map_err(|e| FlowStoreError::Store {
        message: format!("failed to write temp file: {e}"),
    })?;
    std::fs::rename(&temp_path, path).map_err(|e| FlowStoreError::Store {
        message: format!("failed to rename temp file: {e}"),
    })?;
    Ok(())
}

#[async_trait]
impl FlowStore for FileFlowStore {
    async fn put_flow(&self, flow: &AutomationFlow) -> Result<(), FlowStoreError> {
        let path = self.flow_path(&flow.id)?;
        let data = serde_json::to_vec_pretty(flow).map_err(|e| FlowStoreError::Store {
            message: format!("failed to serialize flow: {e}"),
        })?;
        atomic_write(&path, &data)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<AutomationFlow>, FlowStoreError> {
        let path = self.flow_path(flow_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(|e| FlowStoreError::Store {
            message: format!("failed to read flow: {e}"),
        })?;
        let flow = serde_json::from_slice(&data).map_err(|e| FlowStoreError::Store {
            message: format!("failed to deserialize flow: {e}"),
        })?;
        Ok(Some(flow))
    }

    async fn list_flows(
        &self,
        store_id: Option<&str>,
    ) -> Result<Vec<AutomationFlow>, FlowStoreError> {
        let entries = std::fs::read_dir(&self.flows_dir).map_err(|e| FlowStoreError::Store {
            message: format!("failed to read flows directory: {e}"),
        })?;

        let mut flows = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FlowStoreError::Store {
                message: format!("failed to read dir entry: {e}"),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| FlowStoreError::Store {
                message: format!("failed to read flow file: {e}"),
            })?;
            match serde_json::from_slice::<AutomationFlow>(&data) {
                Ok(flow) if store_id.map_or(true, |s| flow.store_id == s) => flows.push(flow),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable flow file");
                }
            }
        }

        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(flows)
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<bool, FlowStoreError> {
        let path = self.flow_path(flow_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| FlowStoreError::Store {
            message: format!("failed to delete flow: {e}"),
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::guide_flow;

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::new(dir.path().to_path_buf()).unwrap();
        let flow = guide_flow();

        store.put_flow(&flow).await.unwrap();
        assert_eq!(store.get_flow(&flow.id).await.unwrap(), Some(flow.clone()));
        assert!(dir
            .path()
            .join(format!("automation_flows/{}.json", flow.id))
            .exists());

        assert!(store.delete_flow(&flow.id).await.unwrap());
        assert!(!store.delete_flow(&flow.id).await.unwrap());
        assert!(store.get_flow(&flow.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::new(dir.path().to_path_buf()).unwrap();
        let a = guide_flow().with_id("a");
        let mut b = guide_flow().with_id("b");
        b.store_id = "other-store".into();
        store.put_flow(&a).await.unwrap();
        store.put_flow(&b).await.unwrap();

        assert_eq!(store.list_flows(None).await.unwrap().len(), 2);
        let mine = store.list_flows(Some("other-store")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "b");
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.get_flow("../../etc/passwd").await.is_err());
    }
}

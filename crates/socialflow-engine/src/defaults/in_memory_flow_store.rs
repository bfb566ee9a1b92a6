//! In-memory flow store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::FlowStoreError;
use crate::traits::FlowStore;
use crate::types::AutomationFlow;

/// In-memory implementation of [`FlowStore`]. Suitable for tests and
/// embedding hosts that persist flows elsewhere.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<BTreeMap<String, AutomationFlow>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn put_flow(&self, flow: &AutomationFlow) -> Result<(), FlowStoreError> {
        self.flows
            .write()
            .await
            .insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<AutomationFlow>, FlowStoreError> {
        Ok(self.flows.read().await.get(flow_id).cloned())
    }

    async fn list_flows(
        &self,
        store_id: Option<&str>,
    ) -> Result<Vec<AutomationFlow>, FlowStoreError> {
        let mut flows: Vec<AutomationFlow> = self
            .flows
            .read()
            .await
            .values()
            .filter(|f| store_id.map_or(true, |s| f.store_id == s))
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(flows)
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<bool, FlowStoreError> {
        Ok(self.flows.write().await.remove(flow_id).is_some())
    }
}

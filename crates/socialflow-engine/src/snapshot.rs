//! Content-addressed flow snapshots.
//!
//! A run freezes the flow's definition and settings at creation. The
//! snapshot's `content_hash` is the lowercase hex SHA-256 of the canonical
//! definition JSON, so two runs share a hash exactly when they executed the
//! same graph. Node and connection order is part of the graph (it decides
//! fan-out order) and therefore part of the hash.

use sha2::{Digest, Sha256};

use super::types::{AutomationFlow, FlowDefinition, FlowSnapshot};

/// Hash a flow definition. Canvas positions are excluded: moving a node in
/// the builder does not change what runs.
pub fn compute_definition_hash(definition: &FlowDefinition) -> String {
    let mut canonical = definition.clone();
    for node in &mut canonical.nodes {
        node.position = None;
    }
    let bytes =
        serde_json::to_vec(&canonical).expect("FlowDefinition serialization should never fail");
    let hash = Sha256::digest(&bytes);
    format!("{hash:x}")
}

impl FlowSnapshot {
    pub fn capture(flow: &AutomationFlow) -> Self {
        Self {
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            definition: flow.flow_definition.clone(),
            settings: flow.settings.clone(),
            content_hash: compute_definition_hash(&flow.flow_definition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::guide_flow;
    use crate::types::{FlowConnection, FlowNode, NodeData};

    #[test]
    fn same_graph_same_hash() {
        let a = guide_flow();
        let b = guide_flow();
        assert_eq!(
            compute_definition_hash(&a.flow_definition),
            compute_definition_hash(&b.flow_definition)
        );
        assert_eq!(compute_definition_hash(&a.flow_definition).len(), 64);
    }

    #[test]
    fn position_does_not_affect_hash() {
        let flow = guide_flow();
        let mut moved = flow.flow_definition.clone();
        moved.nodes[0].position = Some((120.0, 40.0));
        assert_eq!(
            compute_definition_hash(&flow.flow_definition),
            compute_definition_hash(&moved)
        );
    }

    #[test]
    fn content_change_changes_hash() {
        let flow = guide_flow();
        let mut edited = flow.flow_definition.clone();
        edited.nodes.push(FlowNode::new(
            "extra",
            NodeData::Tag {
                tag_name: "x".into(),
            },
        ));
        edited
            .connections
            .push(FlowConnection::new("e-extra", "trigger", "extra"));
        assert_ne!(
            compute_definition_hash(&flow.flow_definition),
            compute_definition_hash(&edited)
        );
    }

    #[test]
    fn capture_freezes_settings() {
        let flow = guide_flow();
        let snap = FlowSnapshot::capture(&flow);
        assert_eq!(snap.flow_id, flow.id);
        assert_eq!(snap.settings, flow.settings);
        assert_eq!(snap.definition, flow.flow_definition);
    }
}

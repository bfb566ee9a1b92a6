use std::collections::HashSet;

use crate::errors::ValidationError;
use crate::graph::FlowGraph;
use crate::types::{AutomationFlow, FlowDefinition, NodeData};

/// Validate a `FlowDefinition` for structural correctness.
///
/// Returns `Ok(())` if the graph is executable, or a [`ValidationError`]
/// listing every problem found.
pub fn validate_definition(definition: &FlowDefinition) -> Result<(), ValidationError> {
    ValidationError::check(definition_problems(definition))
}

/// Validate a whole flow: its graph plus its trigger conditions. This is
/// what activation enforces.
pub fn validate_flow(flow: &AutomationFlow) -> Result<(), ValidationError> {
    let mut problems = flow.trigger_conditions.problems(flow.trigger_type);
    problems.extend(definition_problems(&flow.flow_definition));
    ValidationError::check(problems)
}

fn definition_problems(definition: &FlowDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push("Flow has no nodes".to_string());
        return errors;
    }

    // 1. No duplicate node IDs.
    let mut seen_ids = HashSet::new();
    for node in &definition.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node ID: {}", node.id));
        }
    }

    // 2. No duplicate connection IDs.
    let mut seen_conn_ids = HashSet::new();
    for conn in &definition.connections {
        if !seen_conn_ids.insert(conn.id.as_str()) {
            errors.push(format!("Duplicate connection ID: {}", conn.id));
        }
    }

    // 3. All connection endpoints reference existing nodes.
    for conn in &definition.connections {
        if !seen_ids.contains(conn.from.as_str()) {
            errors.push(format!(
                "Connection {} references unknown source node: {}",
                conn.id, conn.from
            ));
        }
        if !seen_ids.contains(conn.to.as_str()) {
            errors.push(format!(
                "Connection {} references unknown target node: {}",
                conn.id, conn.to
            ));
        }
    }

    // 4. Exactly one trigger, with no inbound connections.
    let graph = FlowGraph::new(definition);
    let triggers: Vec<&str> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.data, NodeData::Trigger))
        .map(|n| n.id.as_str())
        .collect();
    match triggers.as_slice() {
        [] => errors.push("Flow has no trigger node".to_string()),
        [_] => {}
        many => errors.push(format!("Flow has {} trigger nodes: {}", many.len(), many.join(", "))),
    }
    for trigger in &triggers {
        if !graph.incoming(trigger).is_empty() {
            errors.push(format!("Trigger node {trigger} has inbound connections"));
        }
    }

    // 5. Every other node has an inbound connection and is reachable.
    let reachable = triggers
        .first()
        .map(|t| graph.reachable_from(t))
        .unwrap_or_default();
    for node in &definition.nodes {
        if matches!(node.data, NodeData::Trigger) {
            continue;
        }
        if graph.incoming(&node.id).is_empty() {
            errors.push(format!("Node {} has no inbound connection", node.id));
        } else if !triggers.is_empty() && !reachable.contains(node.id.as_str()) {
            errors.push(format!("Node {} is unreachable from the trigger", node.id));
        }
    }

    // 6. Acyclic.
    for edge in graph.back_edges() {
        errors.push(format!("Connection {edge} creates a cycle"));
    }

    // 7. Per-node payload checks.
    for node in &definition.nodes {
        match &node.data {
            NodeData::Condition { .. } if graph.outgoing(&node.id).is_empty() => {
                errors.push(format!("Condition node {} has no outbound connection", node.id));
            }
            NodeData::Webhook { url, .. }
                if !(url.starts_with("https://") || url.starts_with("http://")) =>
            {
                errors.push(format!("Webhook node {} has invalid URL: {url}", node.id));
            }
            NodeData::Message { content, media } if content.trim().is_empty() && media.is_empty() => {
                errors.push(format!("Message node {} is empty", node.id));
            }
            NodeData::Tag { tag_name } if tag_name.trim().is_empty() => {
                errors.push(format!("Tag node {} has no tag name", node.id));
            }
            _ => {}
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::guide_flow;
    use crate::types::{ConditionType, FlowConnection, FlowNode, TriggerConditions};

    fn tag(id: &str) -> FlowNode {
        FlowNode::new(
            id,
            NodeData::Tag {
                tag_name: "lead".into(),
            },
        )
    }

    fn problems(def: &FlowDefinition) -> Vec<String> {
        validate_definition(def).err().map(|e| e.problems).unwrap_or_default()
    }

    #[test]
    fn guide_flow_is_valid() {
        assert!(validate_flow(&guide_flow()).is_ok());
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let def = FlowDefinition {
            nodes: vec![FlowNode::new("t", NodeData::Trigger), tag("a"), tag("b"), tag("c")],
            connections: vec![
                FlowConnection::new("e1", "t", "a"),
                FlowConnection::new("e2", "b", "c"),
            ],
        };
        let p = problems(&def);
        assert!(p.iter().any(|m| m == "Node b has no inbound connection"));
        assert!(p.iter().any(|m| m == "Node c is unreachable from the trigger"));
    }

    #[test]
    fn cycle_is_rejected() {
        let def = FlowDefinition {
            nodes: vec![FlowNode::new("t", NodeData::Trigger), tag("a"), tag("b")],
            connections: vec![
                FlowConnection::new("e1", "t", "a"),
                FlowConnection::new("e2", "a", "b"),
                FlowConnection::new("e3", "b", "a"),
            ],
        };
        assert_eq!(problems(&def), vec!["Connection e3 creates a cycle"]);
    }

    #[test]
    fn trigger_rules() {
        let none = FlowDefinition {
            nodes: vec![tag("a")],
            connections: vec![],
        };
        assert!(problems(&none).iter().any(|m| m.contains("no trigger")));

        let two = FlowDefinition {
            nodes: vec![
                FlowNode::new("t1", NodeData::Trigger),
                FlowNode::new("t2", NodeData::Trigger),
            ],
            connections: vec![FlowConnection::new("e1", "t1", "t2")],
        };
        let p = problems(&two);
        assert!(p.iter().any(|m| m.contains("2 trigger nodes")));
        assert!(p.iter().any(|m| m == "Trigger node t2 has inbound connections"));
    }

    #[test]
    fn dangling_and_duplicate_ids() {
        let def = FlowDefinition {
            nodes: vec![FlowNode::new("t", NodeData::Trigger), tag("a"), tag("a")],
            connections: vec![
                FlowConnection::new("e1", "t", "a"),
                FlowConnection::new("e1", "t", "ghost"),
            ],
        };
        let p = problems(&def);
        assert!(p.contains(&"Duplicate node ID: a".to_string()));
        assert!(p.contains(&"Duplicate connection ID: e1".to_string()));
        assert!(p.contains(&"Connection e1 references unknown target node: ghost".to_string()));
    }

    #[test]
    fn condition_needs_outbound_edge() {
        let def = FlowDefinition {
            nodes: vec![
                FlowNode::new("t", NodeData::Trigger),
                FlowNode::new(
                    "c",
                    NodeData::Condition {
                        condition_type: ConditionType::TagBased,
                        condition_value: "vip".into(),
                    },
                ),
            ],
            connections: vec![FlowConnection::new("e1", "t", "c")],
        };
        assert_eq!(problems(&def), vec!["Condition node c has no outbound connection"]);
    }

    #[test]
    fn webhook_url_must_be_http() {
        let def = FlowDefinition {
            nodes: vec![
                FlowNode::new("t", NodeData::Trigger),
                FlowNode::new(
                    "w",
                    NodeData::Webhook {
                        url: "ftp://example.test".into(),
                        payload_template: serde_json::Value::Null,
                    },
                ),
            ],
            connections: vec![FlowConnection::new("e1", "t", "w")],
        };
        assert_eq!(problems(&def).len(), 1);
    }

    #[test]
    fn validate_flow_includes_trigger_conditions() {
        let mut flow = guide_flow();
        flow.trigger_conditions = TriggerConditions::new([]);
        let err = validate_flow(&flow).unwrap_err();
        assert!(err.problems.iter().any(|p| p.contains("no platforms")));
    }
}

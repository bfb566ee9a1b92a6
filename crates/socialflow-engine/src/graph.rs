//! Adjacency over a flow definition and branch selection.

use std::collections::{HashMap, HashSet};

use crate::types::{FlowConnection, FlowDefinition};

/// Read-only adjacency view of a [`FlowDefinition`]. Edge order is the
/// definition's connection order, which decides fan-out order.
pub struct FlowGraph<'a> {
    definition: &'a FlowDefinition,
    outgoing: HashMap<&'a str, Vec<&'a FlowConnection>>,
    incoming: HashMap<&'a str, Vec<&'a FlowConnection>>,
}

impl<'a> FlowGraph<'a> {
    pub fn new(definition: &'a FlowDefinition) -> Self {
        let mut outgoing: HashMap<&str, Vec<&FlowConnection>> = HashMap::new();
        let mut incoming: HashMap<&str, Vec<&FlowConnection>> = HashMap::new();
        for conn in &definition.connections {
            outgoing.entry(conn.from.as_str()).or_default().push(conn);
            incoming.entry(conn.to.as_str()).or_default().push(conn);
        }
        Self {
            definition,
            outgoing,
            incoming,
        }
    }

    pub fn definition(&self) -> &'a FlowDefinition {
        self.definition
    }

    pub fn outgoing(&self, node_id: &str) -> &[&'a FlowConnection] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, node_id: &str) -> &[&'a FlowConnection] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every target of `node_id`, labels ignored, without duplicates.
    pub fn successors(&self, node_id: &str) -> Vec<String> {
        dedup_targets(self.outgoing(node_id).iter().copied())
    }

    /// Targets to continue with after `node_id`.
    ///
    /// Without a label every outbound edge is followed. With a label, edges
    /// whose label is equivalent to it are followed (compared trimmed and
    /// case-insensitively, `yes`/`true` meaning `matched` and `no`/`false`
    /// meaning `unmatched`). When none match and the node has exactly one
    /// outbound edge that carries no label, that edge is taken.
    pub fn next_nodes(&self, node_id: &str, label: Option<&str>) -> Vec<String> {
        let edges = self.outgoing(node_id);
        let Some(label) = label else {
            return self.successors(node_id);
        };
        let wanted = canonical_label(label);
        let matching: Vec<&FlowConnection> = edges
            .iter()
            .copied()
            .filter(|c| c.label.as_deref().map(canonical_label).as_deref() == Some(wanted.as_str()))
            .collect();
        if !matching.is_empty() {
            return dedup_targets(matching);
        }
        match edges {
            [only] if only.label.is_none() => vec![only.to.clone()],
            _ => Vec::new(),
        }
    }

    /// Node ids reachable from `start`, `start` included.
    pub fn reachable_from(&self, start: &str) -> HashSet<&'a str> {
        let def: &'a FlowDefinition = self.definition;
        let mut seen = HashSet::new();
        let Some(start) = def.node(start) else {
            return seen;
        };
        let mut stack = vec![start.id.as_str()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for &conn in self.outgoing(id) {
                if !seen.contains(conn.to.as_str()) {
                    stack.push(conn.to.as_str());
                }
            }
        }
        seen
    }

    /// Ids of edges that close a cycle, found by DFS from every node. A
    /// back-edge points to a node already on the current recursion stack,
    /// so each cycle contributes at least one.
    pub fn back_edges(&self) -> Vec<&'a str> {
        let mut back = Vec::new();
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let def: &'a FlowDefinition = self.definition;
        for node in &def.nodes {
            if !visited.contains(node.id.as_str()) {
                self.dfs(&node.id, &mut visited, &mut in_stack, &mut back);
            }
        }
        back
    }

    fn dfs(
        &self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
        back: &mut Vec<&'a str>,
    ) {
        visited.insert(node);
        in_stack.insert(node);
        for &conn in self.outgoing(node) {
            let to = conn.to.as_str();
            if in_stack.contains(to) {
                back.push(conn.id.as_str());
            } else if !visited.contains(to) {
                self.dfs(to, visited, in_stack, back);
            }
        }
        in_stack.remove(node);
    }
}

fn dedup_targets<'c>(edges: impl IntoIterator<Item = &'c FlowConnection>) -> Vec<String> {
    let mut seen = HashSet::new();
    edges
        .into_iter()
        .filter(|c| seen.insert(c.to.as_str()))
        .map(|c| c.to.clone())
        .collect()
}

/// Normalize a branch label for comparison.
pub fn canonical_label(label: &str) -> String {
    let lower = label.trim().to_lowercase();
    match lower.as_str() {
        "matched" | "yes" | "true" => "matched".to_string(),
        "unmatched" | "no" | "false" => "unmatched".to_string(),
        _ => lower,
    }
}

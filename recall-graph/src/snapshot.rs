//! Point-in-time graph snapshots and structural diffs
//!
//! A snapshot owns a frozen copy of every node and edge at capture time, so
//! later graph mutations are never visible through it.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{Edge, Node};

/// Snapshot header, listed without loading the frozen graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub id: String,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
    pub node_count: usize,
    pub edge_count: usize,
    pub episode_count: usize,
    pub metadata: BTreeMap<String, String>,
}

/// Immutable capture of graph state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Snapshot {
    /// Freeze the given state. `nodes` and `edges` are owned copies.
    pub fn capture(
        trigger: impl Into<String>,
        metadata: BTreeMap<String, String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        episode_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            meta: SnapshotMeta {
                id: uuid::Uuid::new_v4().to_string(),
                trigger: trigger.into(),
                created_at: now,
                node_count: nodes.len(),
                edge_count: edges.len(),
                episode_count,
                metadata,
            },
            nodes,
            edges,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }
}

/// One changed field of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: &'static str,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    pub id: String,
    pub label: String,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightChange {
    pub edge: Edge,
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiff {
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
    pub changed: Vec<NodeChange>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDiff {
    pub added: Vec<Edge>,
    pub removed: Vec<Edge>,
    pub strengthened: Vec<WeightChange>,
    pub weakened: Vec<WeightChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStats {
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub nodes_changed: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub edges_strengthened: usize,
    pub edges_weakened: usize,
    /// Node count delta plus edge count delta
    pub net_change: i64,
}

/// Structural delta between two snapshots
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    pub from: SnapshotMeta,
    pub to: SnapshotMeta,
    pub nodes: NodeDiff,
    pub edges: EdgeDiff,
    pub stats: DiffStats,
}

fn node_changes(before: &Node, after: &Node) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut check = |field: &'static str, from: String, to: String| {
        if from != to {
            changes.push(FieldChange { field, from, to });
        }
    };

    check("label", before.label.clone(), after.label.clone());
    check(
        "type",
        before.node_type.to_string(),
        after.node_type.to_string(),
    );
    check(
        "mentionCount",
        before.mention_count.to_string(),
        after.mention_count.to_string(),
    );
    check(
        "reinforcementCount",
        before.reinforcement_count.to_string(),
        after.reinforcement_count.to_string(),
    );
    check(
        "lastReinforced",
        before.last_reinforced.to_rfc3339(),
        after.last_reinforced.to_rfc3339(),
    );
    let join = |set: &std::collections::BTreeSet<String>| {
        set.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    check("aliases", join(&before.aliases), join(&after.aliases));
    check(
        "sourceFiles",
        before.source_files.len().to_string(),
        after.source_files.len().to_string(),
    );
    check(
        "excerpts",
        before.excerpts.len().to_string(),
        after.excerpts.len().to_string(),
    );
    changes
}

/// Compare two snapshots. Order of nodes/edges in the output follows `to`,
/// then `from` for removals.
pub fn diff(from: &Snapshot, to: &Snapshot) -> SnapshotDiff {
    let old_nodes: HashMap<&str, &Node> = from.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let new_nodes: HashMap<&str, &Node> = to.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut nodes = NodeDiff::default();
    for node in &to.nodes {
        match old_nodes.get(node.id.as_str()) {
            None => nodes.added.push(node.clone()),
            Some(before) => {
                let changes = node_changes(before, node);
                if !changes.is_empty() {
                    nodes.changed.push(NodeChange {
                        id: node.id.clone(),
                        label: node.label.clone(),
                        changes,
                    });
                }
            }
        }
    }
    nodes.removed = from
        .nodes
        .iter()
        .filter(|n| !new_nodes.contains_key(n.id.as_str()))
        .cloned()
        .collect();

    let old_edges: HashMap<&str, &Edge> = from.edges.iter().map(|e| (e.id.as_str(), e)).collect();
    let new_edges: HashMap<&str, &Edge> = to.edges.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut edges = EdgeDiff::default();
    for edge in &to.edges {
        match old_edges.get(edge.id.as_str()) {
            None => edges.added.push(edge.clone()),
            Some(before) if edge.weight > before.weight => edges.strengthened.push(WeightChange {
                edge: edge.clone(),
                from: before.weight,
                to: edge.weight,
            }),
            Some(before) if edge.weight < before.weight => edges.weakened.push(WeightChange {
                edge: edge.clone(),
                from: before.weight,
                to: edge.weight,
            }),
            Some(_) => {}
        }
    }
    edges.removed = from
        .edges
        .iter()
        .filter(|e| !new_edges.contains_key(e.id.as_str()))
        .cloned()
        .collect();

    let node_delta = to.nodes.len() as i64 - from.nodes.len() as i64;
    let edge_delta = to.edges.len() as i64 - from.edges.len() as i64;
    let stats = DiffStats {
        nodes_added: nodes.added.len(),
        nodes_removed: nodes.removed.len(),
        nodes_changed: nodes.changed.len(),
        edges_added: edges.added.len(),
        edges_removed: edges.removed.len(),
        edges_strengthened: edges.strengthened.len(),
        edges_weakened: edges.weakened.len(),
        net_change: node_delta + edge_delta,
    };

    SnapshotDiff {
        from: from.meta.clone(),
        to: to.meta.clone(),
        nodes,
        edges,
        stats,
    }
}

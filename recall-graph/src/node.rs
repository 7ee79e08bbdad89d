//! Graph node and edge types
//!
//! Nodes are resolved entities; edges are weighted, typed relations between
//! them. Adjacency is never stored on a node, it is derived from the edge set.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resolver::normalize;

/// Maximum evidence snippets kept per node (oldest dropped first)
pub const MAX_EXCERPTS: usize = 10;

/// Maximum evidence snippets kept per edge (oldest dropped first)
pub const MAX_EVIDENCE: usize = 20;

/// Hex-encoded SHA-256 prefix used for all content-derived identifiers
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Stable node id derived from the normalized label
pub fn node_id(label: &str) -> String {
    format!("n_{}", content_hash(&normalize(label)))
}

/// Stable edge id, identical for `(a, b)` and `(b, a)`
pub fn edge_id(a: &str, b: &str, edge_type: EdgeType) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!(
        "e_{}",
        content_hash(&format!("{}|{}|{}", lo, hi, edge_type.as_str()))
    )
}

/// Closed set of entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Person,
    Project,
    Tool,
    Concept,
    Decision,
    Event,
    Lesson,
    Place,
    Tag,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Project => "project",
            Self::Tool => "tool",
            Self::Concept => "concept",
            Self::Decision => "decision",
            Self::Event => "event",
            Self::Lesson => "lesson",
            Self::Place => "place",
            Self::Tag => "tag",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = crate::GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "person" => Ok(Self::Person),
            "project" => Ok(Self::Project),
            "tool" => Ok(Self::Tool),
            "concept" => Ok(Self::Concept),
            "decision" => Ok(Self::Decision),
            "event" => Ok(Self::Event),
            "lesson" => Ok(Self::Lesson),
            "place" => Ok(Self::Place),
            "tag" => Ok(Self::Tag),
            other => Err(crate::GraphError::validation(format!(
                "unknown node type: {}",
                other
            ))),
        }
    }
}

/// A resolved entity in the memory graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub label: String,
    pub aliases: BTreeSet<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub first_seen: DateTime<Utc>,
    pub last_reinforced: DateTime<Utc>,
    pub mention_count: u32,
    pub reinforcement_count: u32,
    pub source_files: BTreeSet<String>,
    pub excerpts: Vec<String>,
}

impl Node {
    /// Create a new builder for Node
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Fresh node with no reinforcement history
    pub fn new(label: impl Into<String>, node_type: NodeType, now: DateTime<Utc>) -> Self {
        let label = label.into();
        Self {
            id: node_id(&label),
            label,
            aliases: BTreeSet::new(),
            node_type,
            first_seen: now,
            last_reinforced: now,
            mention_count: 0,
            reinforcement_count: 0,
            source_files: BTreeSet::new(),
            excerpts: Vec::new(),
        }
    }

    /// Record one reinforcement event carrying `mentions` mentions.
    ///
    /// At least one mention is counted so `mention_count >= reinforcement_count` holds.
    pub fn reinforce(
        &mut self,
        mentions: u32,
        excerpt: Option<&str>,
        source_file: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.mention_count += mentions.max(1);
        self.reinforcement_count += 1;
        if now > self.last_reinforced {
            self.last_reinforced = now;
        }
        if let Some(excerpt) = excerpt {
            self.push_excerpt(excerpt);
        }
        if let Some(path) = source_file {
            self.source_files.insert(path.to_string());
        }
    }

    /// Append an excerpt, evicting the oldest beyond [`MAX_EXCERPTS`]
    pub fn push_excerpt(&mut self, excerpt: &str) {
        let excerpt = excerpt.trim();
        if excerpt.is_empty() || self.excerpts.iter().any(|e| e == excerpt) {
            return;
        }
        self.excerpts.push(excerpt.to_string());
        if self.excerpts.len() > MAX_EXCERPTS {
            let overflow = self.excerpts.len() - MAX_EXCERPTS;
            self.excerpts.drain(..overflow);
        }
    }

    /// Add an alias unless it duplicates the label
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let alias = alias.trim();
        if alias.is_empty() || normalize(alias) == normalize(&self.label) {
            return false;
        }
        self.aliases.insert(alias.to_string())
    }

    /// Normalized label and alias tokens, used for lexical matching
    pub fn tokens(&self) -> HashSet<String> {
        std::iter::once(&self.label)
            .chain(self.aliases.iter())
            .flat_map(|s| {
                normalize(s)
                    .split_whitespace()
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Text handed to the embedding provider
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{} ({})", self.label, self.node_type);
        if !self.aliases.is_empty() {
            let aliases: Vec<&str> = self.aliases.iter().map(String::as_str).collect();
            text.push_str(&format!(" aka {}", aliases.join(", ")));
        }
        for excerpt in self.excerpts.iter().rev().take(3) {
            text.push_str(". ");
            text.push_str(excerpt);
        }
        text
    }
}

/// Builder for Node with fluent API
#[derive(Debug, Default)]
pub struct NodeBuilder {
    label: Option<String>,
    node_type: Option<NodeType>,
    aliases: Vec<String>,
    seen_at: Option<DateTime<Utc>>,
    mentions: u32,
    source_files: Vec<String>,
}

impl NodeBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Timestamp used for both `first_seen` and `last_reinforced`
    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.seen_at = Some(at);
        self
    }

    /// Number of initial mentions; counts as one reinforcement when non-zero
    pub fn mentions(mut self, mentions: u32) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn source_file(mut self, path: impl Into<String>) -> Self {
        self.source_files.push(path.into());
        self
    }

    /// Build the Node
    pub fn build(self) -> Result<Node, NodeBuilderError> {
        let label = self
            .label
            .filter(|l| !normalize(l).is_empty())
            .ok_or(NodeBuilderError::MissingLabel)?;
        let node_type = self.node_type.ok_or(NodeBuilderError::MissingType)?;

        let mut node = Node::new(label, node_type, self.seen_at.unwrap_or_else(Utc::now));
        for alias in &self.aliases {
            node.add_alias(alias);
        }
        node.source_files.extend(self.source_files);
        if self.mentions > 0 {
            node.mention_count = self.mentions;
            node.reinforcement_count = 1;
        }
        Ok(node)
    }
}

/// Errors that can occur when building a Node
#[derive(Debug, thiserror::Error)]
pub enum NodeBuilderError {
    #[error("Missing required field: label")]
    MissingLabel,
    #[error("Missing required field: type")]
    MissingType,
}

/// Relation kinds; each carries its own base weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    Explicit,
    CoOccurrence,
    Temporal,
    Causal,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::CoOccurrence => "co-occurrence",
            Self::Temporal => "temporal",
            Self::Causal => "causal",
        }
    }

    /// Weight assigned at creation and restored on reinforcement
    pub fn base_weight(&self) -> f64 {
        match self {
            Self::Explicit => 1.0,
            Self::Causal => 0.8,
            Self::CoOccurrence => 0.5,
            Self::Temporal => 0.3,
        }
    }

    /// Causal and temporal relations read source → target
    pub fn directed_by_default(&self) -> bool {
        matches!(self, Self::Causal | Self::Temporal)
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighted relation between two nodes, subject to decay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub directed: bool,
    pub base_weight: f64,
    pub weight: f64,
    pub reinforcement_count: u32,
    pub stability: f64,
    pub first_formed: DateTime<Utc>,
    pub last_reinforced: DateTime<Utc>,
    pub evidence: Vec<String>,
}

impl Edge {
    /// New edge at full base weight
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        edge_type: EdgeType,
        now: DateTime<Utc>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        let base_weight = edge_type.base_weight();
        Self {
            id: edge_id(&source, &target, edge_type),
            source,
            target,
            edge_type,
            directed: edge_type.directed_by_default(),
            base_weight,
            weight: base_weight,
            reinforcement_count: 0,
            stability: 1.0,
            first_formed: now,
            last_reinforced: now,
            evidence: Vec::new(),
        }
    }

    /// True if either endpoint is `node_id`
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }

    /// The endpoint opposite `node_id`, if the edge touches it
    pub fn other_end(&self, node_id: &str) -> Option<&str> {
        if self.source == node_id {
            Some(&self.target)
        } else if self.target == node_id {
            Some(&self.source)
        } else {
            None
        }
    }

    /// Append evidence, evicting the oldest beyond [`MAX_EVIDENCE`]
    pub fn push_evidence(&mut self, evidence: &str) {
        let evidence = evidence.trim();
        if evidence.is_empty() {
            return;
        }
        self.evidence.push(evidence.to_string());
        if self.evidence.len() > MAX_EVIDENCE {
            let overflow = self.evidence.len() - MAX_EVIDENCE;
            self.evidence.drain(..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable_across_surface_forms() {
        assert_eq!(node_id("Marcus"), node_id("  marcus "));
        assert_eq!(node_id("Marcus's"), node_id("marcus"));
        assert_ne!(node_id("Marcus"), node_id("Marco"));
        assert!(node_id("Marcus").starts_with("n_"));
    }

    #[test]
    fn test_edge_id_symmetry() {
        for edge_type in [
            EdgeType::Explicit,
            EdgeType::CoOccurrence,
            EdgeType::Temporal,
            EdgeType::Causal,
        ] {
            assert_eq!(edge_id("n_a", "n_b", edge_type), edge_id("n_b", "n_a", edge_type));
        }
        assert_ne!(
            edge_id("n_a", "n_b", EdgeType::Explicit),
            edge_id("n_a", "n_b", EdgeType::Causal)
        );
    }

    #[test]
    fn test_excerpts_are_fifo_capped() {
        let mut node = Node::new("Rust", NodeType::Tool, Utc::now());
        for i in 0..15 {
            node.push_excerpt(&format!("excerpt {}", i));
        }
        assert_eq!(node.excerpts.len(), MAX_EXCERPTS);
        assert_eq!(node.excerpts[0], "excerpt 5");
        assert_eq!(node.excerpts[9], "excerpt 14");
    }

    #[test]
    fn test_reinforce_keeps_mentions_ahead_of_reinforcements() {
        let mut node = Node::new("Marcus", NodeType::Person, Utc::now());
        node.reinforce(0, Some("met Marcus"), Some("notes/a.md"), Utc::now());
        node.reinforce(3, None, Some("notes/b.md"), Utc::now());
        assert_eq!(node.reinforcement_count, 2);
        assert_eq!(node.mention_count, 4);
        assert_eq!(node.source_files.len(), 2);
        assert!(node.mention_count >= node.reinforcement_count);
    }

    #[test]
    fn test_alias_matching_label_is_ignored() {
        let mut node = Node::new("Marcus", NodeType::Person, Utc::now());
        assert!(!node.add_alias("marcus"));
        assert!(node.add_alias("Marc"));
        assert!(node.tokens().contains("marc"));
    }

    #[test]
    fn test_builder_missing_type() {
        let result = Node::builder().label("Rust").build();
        assert!(matches!(result, Err(NodeBuilderError::MissingType)));

        let result = Node::builder().label("  ").node_type(NodeType::Tool).build();
        assert!(matches!(result, Err(NodeBuilderError::MissingLabel)));
    }

    #[test]
    fn test_edge_evidence_cap_and_other_end() {
        let mut edge = Edge::new("n_a", "n_b", EdgeType::CoOccurrence, Utc::now());
        for i in 0..25 {
            edge.push_evidence(&format!("seen together {}", i));
        }
        assert_eq!(edge.evidence.len(), MAX_EVIDENCE);
        assert_eq!(edge.other_end("n_a"), Some("n_b"));
        assert_eq!(edge.other_end("n_c"), None);
        assert_eq!(edge.weight, edge.base_weight);
        assert!(!edge.directed);
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("Person".parse::<NodeType>().unwrap(), NodeType::Person);
        assert!("robot".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_node_serialization() {
        let node = Node::builder()
            .label("Marcus")
            .node_type(NodeType::Person)
            .alias("Marc")
            .mentions(2)
            .build()
            .unwrap();

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "person");
        assert_eq!(json["mentionCount"], 2);

        let bytes = bincode::serialize(&node).unwrap();
        let decoded: Node = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, node);
    }
}

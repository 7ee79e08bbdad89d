//! Hybrid recall engine
//!
//! Scores candidate nodes on four signals and blends them with configured
//! weights:
//!
//! - semantic: cosine similarity between the query and node embeddings
//! - graph: lexical seeds score 1.0, neighbours `hop_decay^hop` up to `hops` away
//! - recency: half-life decay on `last_reinforced`
//! - importance: saturating log curve over mention and reinforcement counts
//!
//! Candidates come from the vector index and from graph traversal. Edge
//! weights are always the decayed value at query time.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DecayConfig, GraphConfig, RecallWeights};
use crate::decay;
use crate::embedding::cosine_similarity;
use crate::episode::Episode;
use crate::node::{Edge, Node, NodeType};
use crate::procedure::{find_relevant, MatchOptions, ProcedureMatch};
use crate::resolver::normalize;
use crate::storage::GraphStore;

/// Per-query overrides; unset fields fall back to [`crate::config::RecallConfig`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallOptions {
    pub limit: Option<usize>,
    pub hops: Option<usize>,
    /// Only return nodes of these types (all types when empty)
    pub types: Vec<NodeType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub include_episodes: bool,
    /// Contexts for procedure matching
    pub contexts: Vec<String>,
    pub weights: Option<RecallWeights>,
    pub procedures: MatchOptions,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            limit: None,
            hops: None,
            types: Vec::new(),
            since: None,
            until: None,
            include_episodes: true,
            contexts: Vec::new(),
            weights: None,
            procedures: MatchOptions::default(),
        }
    }
}

impl RecallOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn hops(mut self, hops: usize) -> Self {
        self.hops = Some(hops);
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.types.push(node_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    pub fn weights(mut self, weights: RecallWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn without_episodes(mut self) -> Self {
        self.include_episodes = false;
        self
    }
}

/// Individual subscores, each within `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubScores {
    pub semantic: f64,
    pub graph: f64,
    pub recency: f64,
    pub importance: f64,
}

impl SubScores {
    fn composite(&self, weights: &RecallWeights) -> f64 {
        self.semantic * weights.semantic
            + self.graph * weights.graph
            + self.recency * weights.recency
            + self.importance * weights.importance
    }
}

/// A neighbour of a recalled node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub node_id: String,
    pub label: String,
    pub relationship: String,
    /// Decayed weight at query time
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResult {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub score: f64,
    pub scores: SubScores,
    pub connections: Vec<Connection>,
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResponse {
    pub results: Vec<RecallResult>,
    pub procedures: Vec<ProcedureMatch>,
}

impl RecallResponse {
    /// Ids of every episode attached to a result
    pub fn episode_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.results
            .iter()
            .flat_map(|r| r.episodes.iter())
            .filter(|e| seen.insert(e.id.clone()))
            .map(|e| e.id.clone())
            .collect()
    }
}

/// Lowercased, non-empty query terms
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(normalize)
        .filter(|t| !t.is_empty())
        .collect()
}

/// `0.5^(days / half_life)`
pub fn recency_score(last_reinforced: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 0.0;
    }
    let days = (now - last_reinforced).num_seconds().max(0) as f64 / 86_400.0;
    0.5_f64.powf(days / half_life_days).clamp(0.0, 1.0)
}

/// Mean of `min(1, ln(1+c) / ln(1+saturation))` over mention and reinforcement counts
pub fn importance_score(node: &Node, saturation: u32) -> f64 {
    let denom = (1.0 + saturation.max(1) as f64).ln();
    let curve = |count: u32| ((1.0 + count as f64).ln() / denom).min(1.0);
    (curve(node.mention_count) + curve(node.reinforcement_count)) / 2.0
}

/// Breadth-first graph scores from `seeds` over non-dormant edges
pub fn graph_scores(
    seeds: &[String],
    adjacency: &HashMap<String, Vec<Edge>>,
    hops: usize,
    hop_decay: f64,
    decay_config: &DecayConfig,
    now: DateTime<Utc>,
) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();

    for seed in seeds {
        if scores.insert(seed.clone(), 1.0).is_none() {
            queue.push_back((seed.clone(), 0));
        }
    }

    while let Some((node_id, depth)) = queue.pop_front() {
        if depth >= hops {
            continue;
        }
        let Some(edges) = adjacency.get(&node_id) else {
            continue;
        };
        let score = hop_decay.powi(depth as i32 + 1);
        for edge in edges {
            if decay::is_dormant(edge, now, decay_config) {
                continue;
            }
            let Some(next) = edge.other_end(&node_id) else {
                continue;
            };
            let best = scores.entry(next.to_string()).or_insert(0.0);
            if score > *best {
                *best = score;
                queue.push_back((next.to_string(), depth + 1));
            }
        }
    }
    scores
}

/// Read-only recall over a store
pub struct RecallEngine<'a> {
    store: &'a GraphStore,
    config: &'a GraphConfig,
}

impl<'a> RecallEngine<'a> {
    pub fn new(store: &'a GraphStore, config: &'a GraphConfig) -> Self {
        Self { store, config }
    }

    /// Score and rank nodes for `query`. `query_vector` is the query
    /// embedding, or `None` for structural-only recall.
    pub fn recall(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        options: &RecallOptions,
        now: DateTime<Utc>,
    ) -> RecallResponse {
        let rc = &self.config.recall;
        let limit = options.limit.unwrap_or(rc.limit);
        let hops = options.hops.unwrap_or(rc.hops);
        let weights = options.weights.unwrap_or(rc.weights);

        let procedures = find_relevant(
            self.store.procedures(),
            query,
            &options.contexts,
            &options.procedures,
            self.config.procedures.min_score,
            self.config.procedures.limit,
            now,
        );

        let terms: HashSet<String> = query_terms(query).into_iter().collect();
        let nodes = self.store.nodes();
        let seeds: Vec<String> = nodes
            .iter()
            .filter(|n| !terms.is_empty() && n.tokens().iter().any(|t| terms.contains(t)))
            .map(|n| n.id.clone())
            .collect();

        let adjacency = self.store.adjacency();
        let graph = graph_scores(&seeds, &adjacency, hops, rc.hop_decay, &self.config.decay, now);

        let mut semantic: HashMap<String, f64> = HashMap::new();
        if let Some(vector) = query_vector {
            for (id, similarity) in self.store.semantic_search(vector, rc.semantic_candidates) {
                if similarity as f64 >= rc.min_similarity {
                    semantic.insert(id, similarity as f64);
                }
            }
        }

        if graph.is_empty() && semantic.is_empty() {
            log::debug!("No candidates for query '{}'", query);
            return RecallResponse {
                results: Vec::new(),
                procedures,
            };
        }

        let mut results: Vec<(usize, RecallResult)> = Vec::new();
        for (order, node) in nodes.iter().enumerate() {
            if !graph.contains_key(&node.id) && !semantic.contains_key(&node.id) {
                continue;
            }
            if !options.types.is_empty() && !options.types.contains(&node.node_type) {
                continue;
            }
            if options.since.is_some_and(|s| node.last_reinforced < s)
                || options.until.is_some_and(|u| node.last_reinforced > u)
            {
                continue;
            }

            let semantic_score = match (semantic.get(&node.id), query_vector) {
                (Some(score), _) => *score,
                (None, Some(vector)) => self
                    .store
                    .get_embedding(&node.id)
                    .map(|r| cosine_similarity(vector, &r.vector) as f64)
                    .unwrap_or(0.0),
                (None, None) => 0.0,
            };
            let scores = SubScores {
                semantic: semantic_score.clamp(0.0, 1.0),
                graph: graph.get(&node.id).copied().unwrap_or(0.0),
                recency: recency_score(node.last_reinforced, now, rc.recency_half_life_days),
                importance: importance_score(node, rc.importance_saturation),
            };

            results.push((
                order,
                RecallResult {
                    id: node.id.clone(),
                    label: node.label.clone(),
                    node_type: node.node_type,
                    score: scores.composite(&weights),
                    scores,
                    connections: Vec::new(),
                    episodes: Vec::new(),
                },
            ));
        }

        results.sort_by(|(oa, a), (ob, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| oa.cmp(ob))
        });
        results.truncate(limit);

        let mut results: Vec<RecallResult> = results.into_iter().map(|(_, r)| r).collect();
        for result in &mut results {
            result.connections = self.connections(&result.id, adjacency.get(&result.id), now);
            if options.include_episodes {
                result.episodes = self
                    .store
                    .episodes_for_node(&result.id)
                    .into_iter()
                    .take(rc.max_episodes)
                    .collect();
            }
        }

        RecallResponse {
            results,
            procedures,
        }
    }

    /// Strongest visible neighbours of `node_id`
    fn connections(&self, node_id: &str, edges: Option<&Vec<Edge>>, now: DateTime<Utc>) -> Vec<Connection> {
        let Some(edges) = edges else {
            return Vec::new();
        };
        let mut connections: Vec<Connection> = edges
            .iter()
            .filter_map(|edge| {
                let weight = decay::current_weight(edge, now, &self.config.decay);
                if weight < self.config.decay.visibility_threshold {
                    return None;
                }
                let other = edge.other_end(node_id)?;
                let node = self.store.get_node(other)?;
                Some(Connection {
                    node_id: node.id,
                    label: node.label,
                    relationship: edge.edge_type.to_string(),
                    weight,
                })
            })
            .collect();

        connections.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        connections.truncate(self.config.recall.max_connections);
        connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EdgeType;
    use chrono::Duration;

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("  Who is Marcus?  "), vec!["who", "is", "marcus"]);
        assert!(query_terms("   ").is_empty());
    }

    #[test]
    fn test_recency_half_life() {
        let now = Utc::now();
        assert!((recency_score(now, now, 30.0) - 1.0).abs() < 1e-9);
        assert!((recency_score(now - Duration::days(30), now, 30.0) - 0.5).abs() < 1e-6);
        assert!((recency_score(now - Duration::days(60), now, 30.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_importance_saturates() {
        let now = Utc::now();
        let mut node = Node::new("Marcus", NodeType::Person, now);
        assert_eq!(importance_score(&node, 50), 0.0);
        node.mention_count = 50;
        node.reinforcement_count = 50;
        assert!((importance_score(&node, 50) - 1.0).abs() < 1e-9);
        node.mention_count = 500;
        assert!((importance_score(&node, 50) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_graph_scores_decay_per_hop() {
        let now = Utc::now();
        let config = DecayConfig::default();
        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        for (a, b) in [("a", "b"), ("b", "c"), ("c", "d")] {
            let edge = Edge::new(a, b, EdgeType::Explicit, now);
            adjacency.entry(a.into()).or_default().push(edge.clone());
            adjacency.entry(b.into()).or_default().push(edge);
        }

        let scores = graph_scores(&["a".to_string()], &adjacency, 2, 0.5, &config, now);
        assert_eq!(scores["a"], 1.0);
        assert_eq!(scores["b"], 0.5);
        assert_eq!(scores["c"], 0.25);
        assert!(!scores.contains_key("d"));
    }

    #[test]
    fn test_graph_scores_skip_dormant_edges() {
        let now = Utc::now();
        let config = DecayConfig::default();
        let stale = Edge::new("a", "b", EdgeType::Temporal, now - Duration::days(400));
        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        adjacency.entry("a".into()).or_default().push(stale.clone());
        adjacency.entry("b".into()).or_default().push(stale);

        let scores = graph_scores(&["a".to_string()], &adjacency, 2, 0.5, &config, now);
        assert!(!scores.contains_key("b"));
    }
}

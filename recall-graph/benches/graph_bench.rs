//! Graph Benchmarks
//!
//! Hot paths of consolidation and recall:
//! - Decay evaluation over many edges
//! - Entity resolution against a populated node list
//! - Graph proximity traversal
//! - Structural recall over an on-disk store

use std::collections::HashMap;

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use recall_graph::config::{DecayConfig, GraphConfig, ResolverConfig};
use recall_graph::decay;
use recall_graph::recall::{graph_scores, RecallEngine};
use recall_graph::{Edge, EdgeType, EntityResolver, GraphStore, Node, NodeType, RawEntity, RecallOptions};
use tempfile::TempDir;

fn labels(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("entity number {}", i)).collect()
}

fn chain_edges(count: usize) -> Vec<Edge> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let mut edge = Edge::new(format!("n_{}", i), format!("n_{}", i + 1), EdgeType::CoOccurrence, now);
            edge.last_reinforced = now - Duration::days((i % 90) as i64);
            edge.reinforcement_count = (i % 7) as u32;
            edge.stability = decay::stability(edge.reinforcement_count, 0.5);
            edge
        })
        .collect()
}

fn bench_decay(c: &mut Criterion) {
    let config = DecayConfig::default();
    let now = Utc::now();
    let mut group = c.benchmark_group("decay");

    for size in [1_000usize, 10_000] {
        let edges = chain_edges(size);
        group.bench_with_input(BenchmarkId::new("current_weight", size), &edges, |b, edges| {
            b.iter(|| {
                edges
                    .iter()
                    .filter(|e| decay::current_weight(e, now, &config) >= config.visibility_threshold)
                    .count()
            })
        });
    }
    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let resolver = EntityResolver::new(ResolverConfig::default());
    let now = Utc::now();
    let mut group = c.benchmark_group("resolver");

    for size in [100usize, 1_000] {
        let nodes: Vec<Node> = labels(size)
            .into_iter()
            .map(|l| Node::new(l, NodeType::Concept, now))
            .collect();
        let hit = RawEntity::new(format!("Entity Number {}", size - 1), NodeType::Concept, 0.9);
        let miss = RawEntity::new("completely unrelated mention", NodeType::Concept, 0.9);

        group.bench_with_input(BenchmarkId::new("exact_last", size), &nodes, |b, nodes| {
            b.iter(|| resolver.resolve(&hit, nodes))
        });
        group.bench_with_input(BenchmarkId::new("new_entity", size), &nodes, |b, nodes| {
            b.iter(|| resolver.resolve(&miss, nodes))
        });
    }
    group.finish();
}

fn bench_traversal(c: &mut Criterion) {
    let config = DecayConfig::default();
    let now = Utc::now();
    let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
    for edge in chain_edges(5_000) {
        adjacency.entry(edge.source.clone()).or_default().push(edge.clone());
        adjacency.entry(edge.target.clone()).or_default().push(edge);
    }
    let seeds: Vec<String> = (0..5_000).step_by(250).map(|i| format!("n_{}", i)).collect();

    c.bench_function("graph_scores_3_hops", |b| {
        b.iter(|| graph_scores(&seeds, &adjacency, 3, 0.5, &config, now))
    });
}

fn bench_structural_recall(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let store = GraphStore::open(temp_dir.path()).unwrap();
    let config = GraphConfig::default();
    let now = Utc::now();

    let nodes: Vec<Node> = labels(2_000)
        .into_iter()
        .map(|l| {
            let mut node = Node::new(l, NodeType::Concept, now);
            node.reinforce(1, None, None, now);
            node
        })
        .collect();
    for node in &nodes {
        store.put_node(node).unwrap();
    }
    for pair in nodes.windows(2) {
        store
            .put_edge(&Edge::new(&pair[0].id, &pair[1].id, EdgeType::CoOccurrence, now))
            .unwrap();
    }

    let engine = RecallEngine::new(&store, &config);
    let options = RecallOptions::default().without_episodes();
    c.bench_function("recall_structural_2000_nodes", |b| {
        b.iter(|| engine.recall("entity 1999", None, &options, now))
    });
}

criterion_group!(
    benches,
    bench_decay,
    bench_resolver,
    bench_traversal,
    bench_structural_recall
);
criterion_main!(benches);

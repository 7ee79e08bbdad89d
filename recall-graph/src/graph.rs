//! The memory graph handle
//!
//! [`MemoryGraph`] owns one store, its configuration and an optional
//! embedding provider. Reads go straight to the store's caches; every
//! mutation takes the writer lock, so snapshots always observe a consistent
//! point.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::GraphConfig;
use crate::consolidation::{
    embed_nodes, ConsolidationReport, Consolidator, EmbedOutcome, Extractor, Ingest,
    SourceDocument,
};
use crate::decay::{self, DecayReport};
use crate::embedding::{provider_from_config, EmbeddingProvider};
use crate::episode::{Episode, EpisodeDraft};
use crate::error::{GraphError, Result};
use crate::node::{edge_id, Edge, EdgeType, Node, NodeType};
use crate::procedure::{find_relevant, Feedback, MatchOptions, Procedure, ProcedureDraft, ProcedureMatch};
use crate::recall::{RecallEngine, RecallOptions, RecallResponse};
use crate::resolver::{normalize, EntityResolver};
use crate::snapshot::{self, Snapshot, SnapshotDiff, SnapshotMeta};
use crate::storage::{EmbeddingRecord, GraphExport, GraphStore, PendingEdge};

/// Direct edit of a node's identity fields
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePatch {
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<NodeType>,
    pub add_aliases: Vec<String>,
    pub remove_aliases: Vec<String>,
}

impl NodePatch {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn add_alias(mut self, alias: impl Into<String>) -> Self {
        self.add_aliases.push(alias.into());
        self
    }

    pub fn remove_alias(mut self, alias: impl Into<String>) -> Self {
        self.remove_aliases.push(alias.into());
        self
    }
}

/// A persistent, decaying knowledge graph
pub struct MemoryGraph {
    store: Arc<GraphStore>,
    config: GraphConfig,
    resolver: EntityResolver,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    writer: Mutex<()>,
}

impl MemoryGraph {
    /// Open the graph at `path`, building the embedding provider named by `config`
    pub fn open(path: impl AsRef<Path>, config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let provider = provider_from_config(&config.embedding)?;
        let store = GraphStore::open(path)?;

        Ok(Self {
            store: Arc::new(store),
            resolver: EntityResolver::new(config.resolver.clone()),
            config,
            provider,
            writer: Mutex::new(()),
        })
    }

    /// Replace the configured embedding provider
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        log::info!("Using embedding provider {}", provider.name());
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn provider(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref()
    }

    // ---------------------------------------------------------------------
    // Consolidation and decay
    // ---------------------------------------------------------------------

    /// Run the consolidation pipeline over `documents`
    pub async fn consolidate(
        &self,
        documents: &[SourceDocument],
        extractor: &dyn Extractor,
    ) -> Result<ConsolidationReport> {
        self.consolidate_at(documents, extractor, Utc::now()).await
    }

    /// [`Self::consolidate`] with an explicit clock
    pub async fn consolidate_at(
        &self,
        documents: &[SourceDocument],
        extractor: &dyn Extractor,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport> {
        let _guard = self.writer.lock().await;

        let Ingest {
            mut report,
            checkpoints,
        } = Consolidator::new(&self.store, &self.resolver, &self.config).ingest(documents, extractor, now)?;

        // Sources are checkpointed as soon as their nodes and edges are committed
        for checkpoint in &checkpoints {
            self.store.put_file_hash(checkpoint)?;
        }

        if let Some(provider) = &self.provider {
            let missing = self.store.nodes_missing_embedding(provider.name());
            let outcome = embed_nodes(&self.store, provider, missing, &self.config.consolidation, now).await?;
            report.new_embeddings = outcome.embedded;
            report.embedding_failures = outcome.failures;
        }

        let sweep = self.sweep(now)?;
        report.decayed_edges = sweep.decayed;
        report.dormant_edges = sweep.dormant;

        let mut metadata = BTreeMap::new();
        metadata.insert("documents".to_string(), report.documents.to_string());
        metadata.insert("newNodes".to_string(), report.new_nodes.to_string());
        metadata.insert("newEdges".to_string(), report.new_edges.to_string());
        let snapshot = self.capture(&self.config.consolidation.snapshot_trigger, metadata, now)?;
        report.snapshot_id = Some(snapshot.id);
        self.store.flush()?;

        log::info!(
            "Consolidation complete: {} new nodes, {} new edges, {} decayed, {} dormant, {} failures",
            report.new_nodes,
            report.new_edges,
            report.decayed_edges,
            report.dormant_edges,
            report.failures.len()
        );
        Ok(report)
    }

    /// Recompute and persist the decayed weight of every edge
    pub async fn decay_sweep(&self) -> Result<DecayReport> {
        self.decay_sweep_at(Utc::now()).await
    }

    pub async fn decay_sweep_at(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let _guard = self.writer.lock().await;
        self.sweep(now)
    }

    /// Caller holds the writer lock
    fn sweep(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let mut report = DecayReport::default();
        for mut edge in self.store.edges() {
            let outcome = decay::refresh(&mut edge, now, &self.config.decay);
            report.record(&outcome);
            if outcome.current != outcome.previous {
                self.store.put_edge(&edge)?;
            }
        }
        log::debug!(
            "Decay sweep: {} edges, {} decayed, {} dormant",
            report.edges_scanned,
            report.decayed,
            report.dormant
        );
        Ok(report)
    }

    /// Embed every node that has no vector from the current provider
    pub async fn embed_nodes(&self) -> Result<EmbedOutcome> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| GraphError::configuration("no embedding provider configured"))?;
        let _guard = self.writer.lock().await;
        let missing = self.store.nodes_missing_embedding(provider.name());
        embed_nodes(&self.store, provider, missing, &self.config.consolidation, Utc::now()).await
    }

    // ---------------------------------------------------------------------
    // Recall
    // ---------------------------------------------------------------------

    /// Hybrid semantic and structural recall
    pub async fn recall(&self, query: &str, options: &RecallOptions) -> Result<RecallResponse> {
        self.recall_at(query, options, Utc::now()).await
    }

    pub async fn recall_at(
        &self,
        query: &str,
        options: &RecallOptions,
        now: DateTime<Utc>,
    ) -> Result<RecallResponse> {
        let query_vector = match &self.provider {
            Some(provider) if !query.trim().is_empty() => {
                match self.embed_text(provider, query).await {
                    Ok(vector) => Some(vector),
                    Err(e) if e.is_recoverable() => {
                        log::warn!("Query embedding failed, recalling structurally: {}", e);
                        None
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => None,
        };

        let mut response =
            RecallEngine::new(&self.store, &self.config).recall(query, query_vector.as_deref(), options, now);

        let touched = response.episode_ids();
        if !touched.is_empty() {
            let _guard = self.writer.lock().await;
            for id in &touched {
                if let Some(mut episode) = self.store.get_episode(id) {
                    episode.touch(now);
                    self.store.put_episode(&episode)?;
                }
            }
            for episode in response.results.iter_mut().flat_map(|r| r.episodes.iter_mut()) {
                episode.touch(now);
            }
        }
        Ok(response)
    }

    async fn embed_text(&self, provider: &Arc<dyn EmbeddingProvider>, text: &str) -> Result<Vec<f32>> {
        let provider = Arc::clone(provider);
        let text = text.to_string();
        let timeout_ms = self.config.consolidation.embed_timeout_ms;
        let call = tokio::task::spawn_blocking(move || provider.embed(&text));
        match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GraphError::provider(format!("embedding task failed: {}", join_err))),
            Err(_) => Err(GraphError::provider(format!(
                "embedding timed out after {}ms",
                timeout_ms
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Nodes, edges and episodes
    // ---------------------------------------------------------------------

    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.store
            .get_node(id)
            .ok_or_else(|| GraphError::not_found("node", id))
    }

    /// Find a node by label or alias
    pub fn find_node(&self, label: &str) -> Option<Node> {
        let key = normalize(label);
        self.store.nodes().into_iter().find(|n| {
            normalize(&n.label) == key || n.aliases.iter().any(|a| normalize(a) == key)
        })
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.store.nodes()
    }

    /// Edges of a node with weights decayed to now
    pub fn edges_for_node(&self, id: &str) -> Vec<Edge> {
        let now = Utc::now();
        self.store
            .edges_for_node(id)
            .into_iter()
            .map(|mut e| {
                e.weight = decay::current_weight(&e, now, &self.config.decay);
                e
            })
            .collect()
    }

    pub fn episodes_for_node(&self, id: &str) -> Vec<Episode> {
        self.store.episodes_for_node(id)
    }

    pub fn get_episode(&self, id: &str) -> Result<Episode> {
        self.store
            .get_episode(id)
            .ok_or_else(|| GraphError::not_found("episode", id))
    }

    /// Every edge as stored, without read-time decay
    pub fn edges(&self) -> Vec<Edge> {
        self.store.edges()
    }

    pub fn node_count(&self) -> usize {
        self.store.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.store.edge_count()
    }

    /// Co-occurrences seen fewer times than the promotion threshold
    pub fn pending_edges(&self) -> Vec<PendingEdge> {
        self.store.pending_edges()
    }

    /// Stored vector of a node, if it has one
    pub fn get_embedding(&self, node_id: &str) -> Option<EmbeddingRecord> {
        self.store.get_embedding(node_id)
    }

    /// Change a node's label, type or aliases. A replaced label stays as an alias.
    pub async fn update_node(&self, id: &str, patch: NodePatch) -> Result<Node> {
        let _guard = self.writer.lock().await;
        let mut node = self.get_node(id)?;

        if let Some(label) = patch.label {
            let label = label.trim().to_string();
            if label.is_empty() {
                return Err(GraphError::validation("node label must not be empty"));
            }
            if label != node.label {
                let previous = std::mem::replace(&mut node.label, label);
                node.aliases.retain(|a| normalize(a) != normalize(&node.label));
                node.add_alias(&previous);
            }
        }
        if let Some(node_type) = patch.node_type {
            node.node_type = node_type;
        }
        for alias in &patch.add_aliases {
            node.add_alias(alias);
        }
        for alias in &patch.remove_aliases {
            let key = normalize(alias);
            node.aliases.retain(|a| normalize(a) != key);
        }

        self.store.put_node(&node)?;
        self.store.delete_embedding(&node.id)?;
        log::info!("Updated node {} ({})", node.id, node.label);
        Ok(node)
    }

    /// Add or reinforce an explicit relationship between two existing nodes
    pub async fn add_edge(
        &self,
        source: &str,
        target: &str,
        edge_type: EdgeType,
        evidence: Option<&str>,
    ) -> Result<Edge> {
        if source == target {
            return Err(GraphError::validation("an edge needs two distinct nodes"));
        }
        let _guard = self.writer.lock().await;
        self.get_node(source)?;
        self.get_node(target)?;

        let now = Utc::now();
        let edge = match self.store.get_edge(&edge_id(source, target, edge_type)) {
            Some(mut edge) => {
                decay::reinforce(&mut edge, evidence, now, &self.config.decay);
                edge
            }
            None => {
                let mut edge = Edge::new(source, target, edge_type, now);
                if let Some(evidence) = evidence {
                    edge.push_evidence(evidence);
                }
                edge
            }
        };
        self.store.put_edge(&edge)?;
        Ok(edge)
    }

    /// Record an episode by hand. Every referenced node must exist.
    pub async fn record_episode(&self, draft: EpisodeDraft) -> Result<Episode> {
        let _guard = self.writer.lock().await;
        for r in draft.participants.iter().chain(draft.topics.iter()) {
            self.get_node(&r.node_id)?;
        }
        let episode = draft.into_episode(Utc::now())?;
        if let Some(existing) = self.store.get_episode(&episode.id) {
            return Ok(existing);
        }
        self.store.put_episode(&episode)?;
        Ok(episode)
    }

    /// Fold `absorb_id` into `keep_id`: identity, counts, edges and episode
    /// references move to the kept node and the absorbed node is deleted.
    pub async fn merge_nodes(&self, keep_id: &str, absorb_id: &str) -> Result<Node> {
        if keep_id == absorb_id {
            return Err(GraphError::validation("cannot merge a node into itself"));
        }
        let _guard = self.writer.lock().await;
        let mut keep = self.get_node(keep_id)?;
        let absorb = self.get_node(absorb_id)?;
        let now = Utc::now();

        keep.add_alias(&absorb.label);
        for alias in &absorb.aliases {
            keep.add_alias(alias);
        }
        keep.source_files.extend(absorb.source_files.iter().cloned());
        for excerpt in &absorb.excerpts {
            keep.push_excerpt(excerpt);
        }
        keep.mention_count += absorb.mention_count;
        keep.reinforcement_count += absorb.reinforcement_count;
        keep.first_seen = keep.first_seen.min(absorb.first_seen);
        keep.last_reinforced = keep.last_reinforced.max(absorb.last_reinforced);
        self.store.put_node(&keep)?;

        for edge in self.store.edges_for_node(absorb_id) {
            self.store.delete_edge(&edge.id)?;
            let Some(other) = edge.other_end(absorb_id).map(str::to_string) else {
                continue;
            };
            if other == keep_id {
                continue;
            }

            let mut rewired = edge.clone();
            if rewired.source == absorb_id {
                rewired.source = keep_id.to_string();
            } else {
                rewired.target = keep_id.to_string();
            }
            rewired.id = edge_id(&rewired.source, &rewired.target, rewired.edge_type);

            let merged = match self.store.get_edge(&rewired.id) {
                Some(mut existing) => {
                    existing.reinforcement_count += rewired.reinforcement_count;
                    existing.stability =
                        decay::stability(existing.reinforcement_count, self.config.decay.stability_boost);
                    existing.first_formed = existing.first_formed.min(rewired.first_formed);
                    existing.last_reinforced = existing.last_reinforced.max(rewired.last_reinforced);
                    for evidence in &rewired.evidence {
                        existing.push_evidence(evidence);
                    }
                    existing.weight = decay::current_weight(&existing, now, &self.config.decay);
                    existing
                }
                None => rewired,
            };
            self.store.put_edge(&merged)?;
        }

        for pending in self.store.pending_edges() {
            if pending.source != absorb_id && pending.target != absorb_id {
                continue;
            }
            self.store.delete_pending(&pending.id)?;
            let other = if pending.source == absorb_id {
                &pending.target
            } else {
                &pending.source
            };
            if other == keep_id {
                continue;
            }
            let id = edge_id(keep_id, other, EdgeType::CoOccurrence);
            if self.store.get_edge(&id).is_some() {
                continue;
            }
            let (source, target) = if keep_id <= other.as_str() {
                (keep_id.to_string(), other.clone())
            } else {
                (other.clone(), keep_id.to_string())
            };
            let combined = match self.store.get_pending(&id) {
                Some(existing) => PendingEdge {
                    count: existing.count + pending.count,
                    first_seen: existing.first_seen.min(pending.first_seen),
                    last_seen: existing.last_seen.max(pending.last_seen),
                    ..existing
                },
                None => PendingEdge {
                    id,
                    source,
                    target,
                    ..pending.clone()
                },
            };
            self.store.put_pending(&combined)?;
        }

        for mut episode in self.store.episodes_for_node(absorb_id) {
            if episode.relink(absorb_id, keep_id) {
                self.store.put_episode(&episode)?;
            }
        }

        self.store.delete_node(absorb_id)?;
        self.store.delete_embedding(keep_id)?;
        if let Some(provider) = &self.provider {
            let outcome =
                embed_nodes(&self.store, provider, vec![keep.clone()], &self.config.consolidation, now).await?;
            for failure in outcome.failures {
                log::warn!("Re-embedding {} after merge failed: {}", failure.node_id, failure.error);
            }
        }
        self.store.flush()?;

        log::info!("Merged {} into {} ({})", absorb_id, keep_id, keep.label);
        Ok(keep)
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Freeze the current graph under `trigger`
    pub async fn create_snapshot(
        &self,
        trigger: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<SnapshotMeta> {
        let _guard = self.writer.lock().await;
        self.capture(trigger, metadata, Utc::now())
    }

    /// Caller holds the writer lock
    fn capture(
        &self,
        trigger: &str,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<SnapshotMeta> {
        let edges = self
            .store
            .edges()
            .into_iter()
            .map(|mut e| {
                e.weight = decay::current_weight(&e, now, &self.config.decay);
                e
            })
            .collect();
        let snapshot = Snapshot::capture(
            trigger,
            metadata,
            self.store.nodes(),
            edges,
            self.store.episode_count(),
            now,
        );
        self.store.put_snapshot(&snapshot)?;
        log::info!(
            "Snapshot {} ({}): {} nodes, {} edges",
            snapshot.id(),
            trigger,
            snapshot.meta.node_count,
            snapshot.meta.edge_count
        );
        Ok(snapshot.meta)
    }

    /// Changes between two snapshots
    pub fn diff(&self, from_id: &str, to_id: &str) -> Result<SnapshotDiff> {
        let from = self.snapshot_graph(from_id)?;
        let to = self.snapshot_graph(to_id)?;
        Ok(snapshot::diff(&from, &to))
    }

    /// Snapshot headers, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotMeta>> {
        self.store.list_snapshots()
    }

    /// A snapshot with its frozen nodes and edges
    pub fn snapshot_graph(&self, id: &str) -> Result<Snapshot> {
        self.store
            .get_snapshot(id)?
            .ok_or_else(|| GraphError::not_found("snapshot", id))
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        if self.store.delete_snapshot(id)? {
            Ok(())
        } else {
            Err(GraphError::not_found("snapshot", id))
        }
    }

    // ---------------------------------------------------------------------
    // Procedures
    // ---------------------------------------------------------------------

    /// Store a new procedure. Re-creating an existing statement returns it unchanged.
    pub async fn create_procedure(&self, draft: ProcedureDraft) -> Result<Procedure> {
        let procedure = draft.into_procedure(Utc::now())?;
        let _guard = self.writer.lock().await;
        if let Some(existing) = self.store.get_procedure(&procedure.id) {
            return Ok(existing);
        }
        self.store.put_procedure(&procedure)?;
        log::info!("Created procedure {}", procedure.id);
        Ok(procedure)
    }

    pub fn get_procedure(&self, id: &str) -> Result<Procedure> {
        self.store
            .get_procedure(id)
            .ok_or_else(|| GraphError::not_found("procedure", id))
    }

    pub fn find_procedures(&self, query: &str, contexts: &[String], options: &MatchOptions) -> Vec<ProcedureMatch> {
        find_relevant(
            self.store.procedures(),
            query,
            contexts,
            options,
            self.config.procedures.min_score,
            self.config.procedures.limit,
            Utc::now(),
        )
    }

    /// Record feedback from applying a procedure
    pub async fn apply_feedback(&self, id: &str, feedback: Feedback) -> Result<Procedure> {
        let _guard = self.writer.lock().await;
        let mut procedure = self.get_procedure(id)?;
        let was_flagged = procedure.flagged_for_review();
        procedure.apply(feedback, Utc::now());
        self.store.put_procedure(&procedure)?;
        if !was_flagged && procedure.flagged_for_review() {
            log::warn!(
                "Procedure {} flagged for review after {} contradictions",
                procedure.id,
                procedure.contradictions
            );
        }
        Ok(procedure)
    }

    pub fn list_procedures(&self, flagged_only: bool) -> Vec<Procedure> {
        self.store
            .procedures()
            .into_iter()
            .filter(|p| !flagged_only || p.flagged_for_review())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Export / import
    // ---------------------------------------------------------------------

    /// Whole-graph document with edge weights decayed to now
    pub async fn export(&self) -> Result<GraphExport> {
        let _guard = self.writer.lock().await;
        let now = Utc::now();
        let mut export = self.store.export()?;
        for edge in &mut export.edges {
            edge.weight = decay::current_weight(edge, now, &self.config.decay);
        }
        Ok(export)
    }

    pub async fn import(&self, export: &GraphExport) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.store.import(export)
    }

    pub fn stats(&self) -> serde_json::Value {
        self.store.stats()
    }
}

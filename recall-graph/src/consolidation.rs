//! Consolidation pipeline
//!
//! Turns source documents into graph state. Each changed document is split
//! into sections by an [`Extractor`]; every section's raw entities are
//! resolved against the existing nodes, matched nodes are reinforced, new
//! ones are created, co-occurring pairs accumulate towards edges and the
//! section itself is recorded as an episode.
//!
//! The decay sweep, snapshot and checkpoint steps that close a run belong to
//! [`crate::MemoryGraph::consolidate`], which owns the writer lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{ConsolidationConfig, GraphConfig};
use crate::decay;
use crate::embedding::EmbeddingProvider;
use crate::episode::{EntityRef, EpisodeDraft, SourceType};
use crate::error::{GraphError, Result};
use crate::node::{content_hash, edge_id, Edge, EdgeType, Node, NodeType};
use crate::resolver::{EntityResolver, MatchKind, RawEntity, Resolution};
use crate::storage::{EmbeddingRecord, FileHash, GraphStore, PendingEdge};

/// A text unit handed to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub source_type: SourceType,
}

impl SourceDocument {
    pub fn new(path: impl Into<String>, content: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            source_type,
        }
    }

    pub fn markdown(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(path, content, SourceType::Markdown)
    }
}

/// A heading-delimited slice of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub heading: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Parsing collaborator: documents into sections, sections into raw entities
pub trait Extractor: Send + Sync {
    /// Split a document into sections. The default cuts markdown at ATX headings.
    fn sections(&self, _path: &str, content: &str) -> Result<Vec<Section>> {
        Ok(split_markdown(content))
    }

    /// Entity candidates found in one section
    fn entities(&self, section: &Section) -> Result<Vec<RawEntity>>;
}

/// Split markdown at `#` headings. Text before the first heading becomes an
/// untitled section; sections with no body are dropped.
pub fn split_markdown(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading = String::new();
    let mut body: Vec<&str> = Vec::new();
    let mut start_line = 1;
    let mut last_line = 0;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        last_line = line_no;
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            let title = trimmed.trim_start_matches('#');
            if title.is_empty() || title.starts_with(' ') {
                let end = line_no.saturating_sub(1).max(start_line);
                push_section(&mut sections, &heading, &mut body, start_line, end);
                heading = title.trim().to_string();
                start_line = line_no;
                continue;
            }
        }
        body.push(line);
    }
    push_section(&mut sections, &heading, &mut body, start_line, last_line.max(start_line));
    sections
}

fn push_section(sections: &mut Vec<Section>, heading: &str, body: &mut Vec<&str>, start: usize, end: usize) {
    let text = body.join("\n");
    body.clear();
    if text.trim().is_empty() {
        return;
    }
    sections.push(Section {
        heading: heading.to_string(),
        content: text.trim().to_string(),
        start_line: start,
        end_line: end,
    });
}

/// A document or node the run could not process
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationFailure {
    pub path: String,
    pub error: String,
}

/// A node the embedding job could not embed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingFailure {
    pub node_id: String,
    pub error: String,
}

/// Summary of one consolidation run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub documents: usize,
    pub new_nodes: usize,
    pub new_edges: usize,
    pub reinforced_nodes: usize,
    pub reinforced_edges: usize,
    pub decayed_edges: usize,
    pub dormant_edges: usize,
    /// Pairs touched this run that are still below the co-occurrence threshold
    pub pending_edges: Vec<PendingEdge>,
    pub new_embeddings: usize,
    pub new_episodes: usize,
    pub skipped_files: usize,
    pub snapshot_id: Option<String>,
    pub failures: Vec<ConsolidationFailure>,
    pub embedding_failures: Vec<EmbeddingFailure>,
}

/// Result of the ingest phase: the report so far and the checkpoints to
/// record once the run has been closed out
#[derive(Debug, Default)]
pub struct Ingest {
    pub report: ConsolidationReport,
    pub checkpoints: Vec<FileHash>,
}

/// One resolved node within a section
struct SectionHit {
    id: String,
    mentions: u32,
    surface: String,
    fuzzy_aliases: Vec<String>,
}

/// Runs the resolve/reinforce/co-occur phase over a batch of documents
pub struct Consolidator<'a> {
    store: &'a GraphStore,
    resolver: &'a EntityResolver,
    config: &'a GraphConfig,
}

impl<'a> Consolidator<'a> {
    pub fn new(store: &'a GraphStore, resolver: &'a EntityResolver, config: &'a GraphConfig) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    /// Process every changed document. Extraction errors are recorded in the
    /// report; only store failures abort.
    pub fn ingest(
        &self,
        documents: &[SourceDocument],
        extractor: &dyn Extractor,
        now: DateTime<Utc>,
    ) -> Result<Ingest> {
        let mut ingest = Ingest::default();
        let mut known = self.store.nodes();
        let mut positions: HashMap<String, usize> = known
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        let mut created: HashSet<String> = HashSet::new();
        let mut reinforced: HashSet<String> = HashSet::new();
        let mut pending: BTreeMap<String, PendingEdge> = BTreeMap::new();

        for doc in documents {
            ingest.report.documents += 1;
            let hash = content_hash(&doc.content);
            if self
                .store
                .get_file_hash(&doc.path)
                .is_some_and(|fh| fh.hash == hash)
            {
                log::debug!("Skipping unchanged {}", doc.path);
                ingest.report.skipped_files += 1;
                continue;
            }

            let sections = match extractor.sections(&doc.path, &doc.content) {
                Ok(sections) => sections,
                Err(e) => {
                    log::warn!("Failed to split {}: {}", doc.path, e);
                    ingest.report.failures.push(ConsolidationFailure {
                        path: doc.path.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            for (index, section) in sections.iter().enumerate() {
                let entities = match extractor.entities(section) {
                    Ok(entities) => entities,
                    Err(e) => {
                        log::warn!(
                            "Entity extraction failed for {} section '{}': {}",
                            doc.path,
                            section.heading,
                            e
                        );
                        ingest.report.failures.push(ConsolidationFailure {
                            path: doc.path.clone(),
                            error: format!("section '{}': {}", section.heading, e),
                        });
                        continue;
                    }
                };

                let hits = self.resolve_section(&entities, &mut known, &mut positions, &mut created, now);
                if hits.is_empty() {
                    continue;
                }

                for hit in &hits {
                    let Some(&pos) = positions.get(&hit.id) else {
                        continue;
                    };
                    let excerpt = excerpt_for(section, &hit.surface, self.config.consolidation.max_excerpt_chars);
                    let node = &mut known[pos];
                    node.reinforce(hit.mentions, Some(&excerpt), Some(&doc.path), now);
                    for alias in &hit.fuzzy_aliases {
                        node.add_alias(alias);
                    }
                    self.store.put_node(node)?;
                    if !created.contains(&hit.id) {
                        reinforced.insert(hit.id.clone());
                    }
                }

                let evidence = truncate_chars(
                    &format!("{}: {}", doc.path, section.heading),
                    self.config.consolidation.max_excerpt_chars,
                );
                for (i, a) in hits.iter().enumerate() {
                    for b in &hits[i + 1..] {
                        self.co_occur(&a.id, &b.id, &evidence, now, &mut ingest.report, &mut pending)?;
                    }
                }

                let mut participants = Vec::new();
                let mut topics = Vec::new();
                for hit in &hits {
                    let is_person = positions
                        .get(&hit.id)
                        .is_some_and(|&pos| known[pos].node_type == NodeType::Person);
                    if is_person {
                        participants.push(EntityRef::new(&hit.id, "participant"));
                    } else {
                        topics.push(EntityRef::new(&hit.id, "topic"));
                    }
                }
                let draft = EpisodeDraft {
                    timestamp: Some(now),
                    title: if section.heading.is_empty() {
                        doc.path.clone()
                    } else {
                        section.heading.clone()
                    },
                    content: section.content.clone(),
                    sequence: index as u32,
                    participants,
                    topics,
                    importance: Some((0.3 + 0.1 * hits.len() as f64).min(1.0)),
                    source: doc.path.clone(),
                    source_type: doc.source_type,
                    ..Default::default()
                };
                match draft.into_episode(now) {
                    Ok(episode) if self.store.get_episode(&episode.id).is_none() => {
                        self.store.put_episode(&episode)?;
                        ingest.report.new_episodes += 1;
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("No episode for {} section {}: {}", doc.path, index, e),
                }
            }

            ingest.checkpoints.push(FileHash {
                path: doc.path.clone(),
                hash,
                last_processed: now,
            });
        }

        ingest.report.new_nodes = created.len();
        ingest.report.reinforced_nodes = reinforced.len();
        ingest.report.pending_edges = pending.into_values().collect();

        log::info!(
            "Ingested {} documents: {} new nodes, {} reinforced, {} new edges, {} skipped",
            ingest.report.documents,
            ingest.report.new_nodes,
            ingest.report.reinforced_nodes,
            ingest.report.new_edges,
            ingest.report.skipped_files
        );
        Ok(ingest)
    }

    /// Resolve a section's mentions, creating nodes in `known` as needed.
    /// Returns distinct hits in first-mention order.
    fn resolve_section(
        &self,
        entities: &[RawEntity],
        known: &mut Vec<Node>,
        positions: &mut HashMap<String, usize>,
        created: &mut HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<SectionHit> {
        let mut hits: Vec<SectionHit> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for entity in entities {
            let (id, fuzzy_surface) = match self.resolver.resolve(entity, known.as_slice()) {
                Resolution::Existing {
                    id,
                    matched,
                    surface,
                } => {
                    let alias = surface.filter(|_| matched == MatchKind::Fuzzy);
                    (id, alias)
                }
                Resolution::New {
                    id,
                    label,
                    node_type,
                } => {
                    if !positions.contains_key(&id) {
                        positions.insert(id.clone(), known.len());
                        known.push(Node::new(label, node_type, now));
                        created.insert(id.clone());
                    }
                    (id, None)
                }
                Resolution::Dropped(reason) => {
                    log::debug!("Dropped mention '{}': {:?}", entity.text, reason);
                    continue;
                }
            };

            let slot = *index.entry(id.clone()).or_insert_with(|| {
                hits.push(SectionHit {
                    id: id.clone(),
                    mentions: 0,
                    surface: entity.text.trim().to_string(),
                    fuzzy_aliases: Vec::new(),
                });
                hits.len() - 1
            });
            let hit = &mut hits[slot];
            hit.mentions += 1;
            if let Some(alias) = fuzzy_surface {
                if !hit.fuzzy_aliases.contains(&alias) {
                    hit.fuzzy_aliases.push(alias);
                }
            }
        }
        hits
    }

    /// Count one co-occurrence of `a` and `b`; reinforce or materialize the edge
    fn co_occur(
        &self,
        a: &str,
        b: &str,
        evidence: &str,
        now: DateTime<Utc>,
        report: &mut ConsolidationReport,
        pending: &mut BTreeMap<String, PendingEdge>,
    ) -> Result<()> {
        let id = edge_id(a, b, EdgeType::CoOccurrence);

        if let Some(mut edge) = self.store.get_edge(&id) {
            decay::reinforce(&mut edge, Some(evidence), now, &self.config.decay);
            self.store.put_edge(&edge)?;
            report.reinforced_edges += 1;
            return Ok(());
        }

        let (source, target) = if a <= b { (a, b) } else { (b, a) };
        let mut entry = self.store.get_pending(&id).unwrap_or_else(|| PendingEdge {
            id: id.clone(),
            source: source.to_string(),
            target: target.to_string(),
            count: 0,
            first_seen: now,
            last_seen: now,
        });
        entry.count += 1;
        entry.last_seen = now;

        if entry.count >= self.config.consolidation.co_occurrence_threshold {
            let mut edge = Edge::new(source, target, EdgeType::CoOccurrence, now);
            edge.push_evidence(evidence);
            self.store.put_edge(&edge)?;
            self.store.delete_pending(&id)?;
            pending.remove(&id);
            report.new_edges += 1;
            log::debug!("Co-occurrence {} reached threshold after {} sightings", id, entry.count);
        } else {
            self.store.put_pending(&entry)?;
            pending.insert(id, entry);
        }
        Ok(())
    }
}

/// Outcome of a batch embedding job
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    pub embedded: usize,
    pub failures: Vec<EmbeddingFailure>,
}

/// Embed `nodes` with a bounded worker pool and per-call timeout, storing
/// each vector as it arrives. Provider errors of any kind are recorded per
/// node and never abort the batch; only a store write fails the call.
pub async fn embed_nodes(
    store: &GraphStore,
    provider: &Arc<dyn EmbeddingProvider>,
    nodes: Vec<Node>,
    config: &ConsolidationConfig,
    now: DateTime<Utc>,
) -> Result<EmbedOutcome> {
    let mut outcome = EmbedOutcome::default();
    if nodes.is_empty() {
        return Ok(outcome);
    }

    let timeout_ms = config.embed_timeout_ms;
    let semaphore = Arc::new(Semaphore::new(config.embed_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for node in nodes {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let provider = Arc::clone(provider);
        let text = node.searchable_text();
        tasks.spawn(async move {
            let _permit = permit;
            let call = tokio::task::spawn_blocking(move || provider.embed(&text));
            let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(GraphError::provider(format!(
                    "embedding task failed: {}",
                    join_err
                ))),
                Err(_) => Err(GraphError::provider(format!(
                    "embedding timed out after {}ms",
                    timeout_ms
                ))),
            };
            (node.id, result)
        });
    }

    let dimensions = provider.dimensions();
    while let Some(joined) = tasks.join_next().await {
        let (node_id, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Embedding worker panicked: {}", e);
                continue;
            }
        };

        match result {
            Ok(vector) if vector.len() == dimensions => {
                store.put_embedding(&EmbeddingRecord {
                    node_id,
                    provider: provider.name().to_string(),
                    dimensions,
                    vector,
                    created_at: now,
                })?;
                outcome.embedded += 1;
            }
            Ok(vector) => {
                outcome.failures.push(EmbeddingFailure {
                    node_id,
                    error: format!("expected {} dimensions, got {}", dimensions, vector.len()),
                });
            }
            Err(e) => {
                log::warn!("Failed to embed {}: {}", node_id, e);
                outcome.failures.push(EmbeddingFailure {
                    node_id,
                    error: e.to_string(),
                });
            }
        }
    }

    if !outcome.failures.is_empty() {
        log::warn!(
            "Embedded {} nodes, {} failed",
            outcome.embedded,
            outcome.failures.len()
        );
    }
    Ok(outcome)
}

/// The first line of the section mentioning `surface`, else its opening text
fn excerpt_for(section: &Section, surface: &str, max_chars: usize) -> String {
    let needle = surface.to_lowercase();
    let line = section
        .content
        .lines()
        .map(str::trim)
        .find(|line| !needle.is_empty() && line.to_lowercase().contains(&needle))
        .unwrap_or_else(|| section.content.trim());
    truncate_chars(line, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

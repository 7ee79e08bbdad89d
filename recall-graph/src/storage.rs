//! RocksDB graph store with HNSW indexing
//!
//! Every record kind lives under its own key prefix, bincode-encoded, with
//! LZ4 compression. All live records are mirrored in DashMap caches that
//! serve reads; snapshots are loaded from disk on demand, with their headers
//! kept under a separate prefix so listing never decodes a frozen graph.
//! Node insertion order is persisted under `nseq:` so enumeration is stable
//! across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::episode::Episode;
use crate::error::Result;
use crate::migration;
use crate::node::{Edge, Node, NodeType};
use crate::procedure::Procedure;
use crate::snapshot::{Snapshot, SnapshotMeta};

const NODE_PREFIX: &str = "node:";
const NODE_SEQ_PREFIX: &str = "nseq:";
const EDGE_PREFIX: &str = "edge:";
const EPISODE_PREFIX: &str = "ep:";
const PROCEDURE_PREFIX: &str = "proc:";
const VECTOR_PREFIX: &str = "vec:";
const FILE_HASH_PREFIX: &str = "fh:";
const PENDING_PREFIX: &str = "pend:";
const SNAPSHOT_PREFIX: &str = "snap:";
const SNAPSHOT_META_PREFIX: &str = "smeta:";

/// Below this many vectors search is an exact linear scan
const HNSW_MIN_POINTS: usize = 256;

/// Idempotency ledger entry for one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHash {
    pub path: String,
    pub hash: String,
    pub last_processed: DateTime<Utc>,
}

/// Co-occurring pair that has not yet reached the edge threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdge {
    /// Id the edge will have once materialized
    pub id: String,
    pub source: String,
    pub target: String,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Stored node embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRecord {
    pub node_id: String,
    pub provider: String,
    pub dimensions: usize,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Whole-graph document for migration and bulk reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    /// Nodes in insertion order
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub episodes: Vec<Episode>,
    pub procedures: Vec<Procedure>,
    pub embeddings: Vec<EmbeddingRecord>,
    pub pending_edges: Vec<PendingEdge>,
    pub file_hashes: Vec<FileHash>,
    pub snapshots: Vec<Snapshot>,
}

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct EmbeddingPoint {
    vector: Vec<f32>,
}

impl Point for EmbeddingPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.vector, &other.vector)
    }
}

/// RocksDB-backed graph store
pub struct GraphStore {
    db: Arc<DB>,
    nodes: DashMap<String, Node>,
    node_order: RwLock<Vec<String>>,
    node_seq: DashMap<String, u64>,
    next_seq: AtomicU64,
    edges: DashMap<String, Edge>,
    episodes: DashMap<String, Episode>,
    procedures: DashMap<String, Procedure>,
    pending: DashMap<String, PendingEdge>,
    file_hashes: DashMap<String, FileHash>,
    vectors: DashMap<String, EmbeddingRecord>,
    hnsw_index: RwLock<Option<HnswMap<EmbeddingPoint, String>>>,
    hnsw_dirty: AtomicBool,
}

fn record_key(prefix: &str, id: &str) -> String {
    format!("{}{}", prefix, id)
}

/// Key of the insertion-order index entry for sequence number `seq`
fn seq_key(seq: u64) -> String {
    format!("{}{:020}", NODE_SEQ_PREFIX, seq)
}

impl GraphStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        migration::ensure_schema(&db)?;

        log::info!("GraphStore opened at: {}", path.display());

        let store = Self {
            db: Arc::new(db),
            nodes: DashMap::new(),
            node_order: RwLock::new(Vec::new()),
            node_seq: DashMap::new(),
            next_seq: AtomicU64::new(0),
            edges: DashMap::new(),
            episodes: DashMap::new(),
            procedures: DashMap::new(),
            pending: DashMap::new(),
            file_hashes: DashMap::new(),
            vectors: DashMap::new(),
            hnsw_index: RwLock::new(None),
            hnsw_dirty: AtomicBool::new(true),
        };

        store.load_cache()?;
        Ok(store)
    }

    /// Decode every record under `prefix`, skipping ones that fail to decode
    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let Some(id) = key_str.strip_prefix(prefix) else {
                break;
            };
            match bincode::deserialize::<T>(&value) {
                Ok(record) => records.push((id.to_string(), record)),
                Err(e) => log::warn!("Failed to deserialize {}: {}. Skipping.", key_str, e),
            }
        }
        Ok(records)
    }

    fn put_record<T: Serialize>(&self, prefix: &str, id: &str, value: &T) -> Result<()> {
        self.db
            .put(record_key(prefix, id).as_bytes(), bincode::serialize(value)?)?;
        Ok(())
    }

    fn delete_record(&self, prefix: &str, id: &str) -> Result<()> {
        self.db.delete(record_key(prefix, id).as_bytes())?;
        Ok(())
    }

    /// Load existing records into cache on startup
    fn load_cache(&self) -> Result<()> {
        for (id, node) in self.scan::<Node>(NODE_PREFIX)? {
            self.nodes.insert(id, node);
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut max_seq = None;
        let iter = self.db.iterator(IteratorMode::From(
            NODE_SEQ_PREFIX.as_bytes(),
            Direction::Forward,
        ));
        for item in iter {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let Some(seq_str) = key_str.strip_prefix(NODE_SEQ_PREFIX) else {
                break;
            };
            let id = String::from_utf8_lossy(&value).to_string();
            let Ok(seq) = seq_str.parse::<u64>() else {
                log::warn!("Malformed order key {}. Skipping.", key_str);
                continue;
            };
            if self.nodes.contains_key(&id) && !self.node_seq.contains_key(&id) {
                self.node_seq.insert(id.clone(), seq);
                order.push(id);
            }
            max_seq = Some(max_seq.map_or(seq, |m: u64| m.max(seq)));
        }
        let mut next = max_seq.map_or(0, |m| m + 1);

        // Nodes missing from the order index go last, in key order
        let mut orphans: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| !self.node_seq.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        orphans.sort();
        for id in orphans {
            self.db.put(seq_key(next).as_bytes(), id.as_bytes())?;
            self.node_seq.insert(id.clone(), next);
            order.push(id);
            next += 1;
        }
        *self.node_order.write() = order;
        self.next_seq.store(next, Ordering::SeqCst);

        for (id, edge) in self.scan::<Edge>(EDGE_PREFIX)? {
            self.edges.insert(id, edge);
        }
        for (id, episode) in self.scan::<Episode>(EPISODE_PREFIX)? {
            self.episodes.insert(id, episode);
        }
        for (id, procedure) in self.scan::<Procedure>(PROCEDURE_PREFIX)? {
            self.procedures.insert(id, procedure);
        }
        for (id, pending) in self.scan::<PendingEdge>(PENDING_PREFIX)? {
            self.pending.insert(id, pending);
        }
        for (path, hash) in self.scan::<FileHash>(FILE_HASH_PREFIX)? {
            self.file_hashes.insert(path, hash);
        }
        for (id, record) in self.scan::<EmbeddingRecord>(VECTOR_PREFIX)? {
            self.vectors.insert(id, record);
        }

        if !self.nodes.is_empty() {
            log::info!(
                "Loaded {} nodes, {} edges, {} episodes, {} procedures from disk",
                self.nodes.len(),
                self.edges.len(),
                self.episodes.len(),
                self.procedures.len()
            );
        }
        Ok(())
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    /// Insert or replace a node; new ids are appended to the insertion order
    pub fn put_node(&self, node: &Node) -> Result<()> {
        self.put_record(NODE_PREFIX, &node.id, node)?;
        if !self.node_seq.contains_key(&node.id) {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            self.db.put(seq_key(seq).as_bytes(), node.id.as_bytes())?;
            self.node_seq.insert(node.id.clone(), seq);
            self.node_order.write().push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    /// Get a node by ID
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|e| e.clone())
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> Vec<Node> {
        self.node_order
            .read()
            .iter()
            .filter_map(|id| self.get_node(id))
            .collect()
    }

    /// Nodes of the given type, in insertion order
    pub fn nodes_by_type(&self, node_type: NodeType) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| n.node_type == node_type)
            .collect()
    }

    /// Nodes last reinforced within `[since, until]`
    pub fn nodes_reinforced_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| since.map_or(true, |s| n.last_reinforced >= s))
            .filter(|n| until.map_or(true, |u| n.last_reinforced <= u))
            .collect()
    }

    /// Delete a node and its embedding. Edges are the caller's concern.
    pub fn delete_node(&self, id: &str) -> Result<bool> {
        let removed = self.nodes.remove(id).is_some();
        self.delete_record(NODE_PREFIX, id)?;
        if let Some((_, seq)) = self.node_seq.remove(id) {
            self.db.delete(seq_key(seq).as_bytes())?;
        }
        self.node_order.write().retain(|n| n != id);
        self.delete_embedding(id)?;
        Ok(removed)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ---------------------------------------------------------------------
    // Edges
    // ---------------------------------------------------------------------

    pub fn put_edge(&self, edge: &Edge) -> Result<()> {
        self.put_record(EDGE_PREFIX, &edge.id, edge)?;
        self.edges.insert(edge.id.clone(), edge.clone());
        Ok(())
    }

    pub fn get_edge(&self, id: &str) -> Option<Edge> {
        self.edges.get(id).map(|e| e.clone())
    }

    /// All edges, ordered by id
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.iter().map(|e| e.value().clone()).collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    /// Edges with `node_id` at either end
    pub fn edges_for_node(&self, node_id: &str) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.value().touches(node_id))
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    /// Adjacency list over all edges, keyed by node id
    pub fn adjacency(&self) -> HashMap<String, Vec<Edge>> {
        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        for entry in self.edges.iter() {
            let edge = entry.value();
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            adjacency
                .entry(edge.target.clone())
                .or_default()
                .push(edge.clone());
        }
        adjacency
    }

    pub fn delete_edge(&self, id: &str) -> Result<bool> {
        let removed = self.edges.remove(id).is_some();
        self.delete_record(EDGE_PREFIX, id)?;
        Ok(removed)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ---------------------------------------------------------------------
    // Episodes
    // ---------------------------------------------------------------------

    pub fn put_episode(&self, episode: &Episode) -> Result<()> {
        self.put_record(EPISODE_PREFIX, &episode.id, episode)?;
        self.episodes.insert(episode.id.clone(), episode.clone());
        Ok(())
    }

    pub fn get_episode(&self, id: &str) -> Option<Episode> {
        self.episodes.get(id).map(|e| e.clone())
    }

    /// All episodes, oldest first
    pub fn episodes(&self) -> Vec<Episode> {
        let mut episodes: Vec<Episode> = self.episodes.iter().map(|e| e.value().clone()).collect();
        episodes.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        episodes
    }

    /// Episodes referencing `node_id`, most recent first
    pub fn episodes_for_node(&self, node_id: &str) -> Vec<Episode> {
        let mut episodes: Vec<Episode> = self
            .episodes
            .iter()
            .filter(|e| e.value().mentions(node_id))
            .map(|e| e.value().clone())
            .collect();
        episodes.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        episodes
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    // ---------------------------------------------------------------------
    // Procedures
    // ---------------------------------------------------------------------

    pub fn put_procedure(&self, procedure: &Procedure) -> Result<()> {
        self.put_record(PROCEDURE_PREFIX, &procedure.id, procedure)?;
        self.procedures
            .insert(procedure.id.clone(), procedure.clone());
        Ok(())
    }

    pub fn get_procedure(&self, id: &str) -> Option<Procedure> {
        self.procedures.get(id).map(|e| e.clone())
    }

    /// All procedures, ordered by creation time
    pub fn procedures(&self) -> Vec<Procedure> {
        let mut procedures: Vec<Procedure> =
            self.procedures.iter().map(|e| e.value().clone()).collect();
        procedures.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        procedures
    }

    // ---------------------------------------------------------------------
    // Pending co-occurrence edges
    // ---------------------------------------------------------------------

    pub fn put_pending(&self, pending: &PendingEdge) -> Result<()> {
        self.put_record(PENDING_PREFIX, &pending.id, pending)?;
        self.pending.insert(pending.id.clone(), pending.clone());
        Ok(())
    }

    pub fn get_pending(&self, id: &str) -> Option<PendingEdge> {
        self.pending.get(id).map(|e| e.clone())
    }

    pub fn delete_pending(&self, id: &str) -> Result<()> {
        self.pending.remove(id);
        self.delete_record(PENDING_PREFIX, id)
    }

    pub fn pending_edges(&self) -> Vec<PendingEdge> {
        let mut pending: Vec<PendingEdge> = self.pending.iter().map(|e| e.value().clone()).collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    // ---------------------------------------------------------------------
    // File-hash checkpoints
    // ---------------------------------------------------------------------

    pub fn get_file_hash(&self, path: &str) -> Option<FileHash> {
        self.file_hashes.get(path).map(|e| e.clone())
    }

    pub fn put_file_hash(&self, entry: &FileHash) -> Result<()> {
        self.put_record(FILE_HASH_PREFIX, &entry.path, entry)?;
        self.file_hashes.insert(entry.path.clone(), entry.clone());
        Ok(())
    }

    pub fn file_hashes(&self) -> Vec<FileHash> {
        let mut hashes: Vec<FileHash> = self.file_hashes.iter().map(|e| e.value().clone()).collect();
        hashes.sort_by(|a, b| a.path.cmp(&b.path));
        hashes
    }

    // ---------------------------------------------------------------------
    // Embeddings
    // ---------------------------------------------------------------------

    pub fn put_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        self.put_record(VECTOR_PREFIX, &record.node_id, record)?;
        self.vectors.insert(record.node_id.clone(), record.clone());
        self.hnsw_dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_embedding(&self, node_id: &str) -> Option<EmbeddingRecord> {
        self.vectors.get(node_id).map(|e| e.clone())
    }

    pub fn delete_embedding(&self, node_id: &str) -> Result<bool> {
        let removed = self.vectors.remove(node_id).is_some();
        self.delete_record(VECTOR_PREFIX, node_id)?;
        if removed {
            self.hnsw_dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    pub fn embeddings(&self) -> Vec<EmbeddingRecord> {
        let mut records: Vec<EmbeddingRecord> = self.vectors.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    /// Nodes (in insertion order) with no embedding from `provider`
    pub fn nodes_missing_embedding(&self, provider: &str) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| {
                self.vectors
                    .get(&n.id)
                    .map_or(true, |r| r.provider != provider)
            })
            .collect()
    }

    /// Nearest stored node embeddings to `query_vector`, as (node id, cosine)
    pub fn semantic_search(&self, query_vector: &[f32], limit: usize) -> Vec<(String, f32)> {
        if self.vectors.len() < HNSW_MIN_POINTS {
            return self.linear_search(query_vector, limit);
        }
        if self.hnsw_dirty.swap(false, Ordering::SeqCst) {
            self.rebuild_hnsw_index();
        }

        let index_guard = self.hnsw_index.read();
        let index = match index_guard.as_ref() {
            Some(idx) => idx,
            None => return self.linear_search(query_vector, limit),
        };

        let query_point = EmbeddingPoint {
            vector: query_vector.to_vec(),
        };
        let mut search = Search::default();
        let mut results = Vec::new();

        for candidate in index.search(&query_point, &mut search) {
            let similarity = cosine_similarity(query_vector, &candidate.point.vector);
            results.push((candidate.value.clone(), similarity));

            if results.len() >= limit {
                break;
            }
        }

        results
    }

    /// Linear search fallback
    fn linear_search(&self, query_vector: &[f32], limit: usize) -> Vec<(String, f32)> {
        let mut results: Vec<(String, f32)> = self
            .vectors
            .iter()
            .map(|entry| {
                let similarity = cosine_similarity(query_vector, &entry.value().vector);
                (entry.key().clone(), similarity)
            })
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(limit);
        results
    }

    /// Rebuild HNSW index
    fn rebuild_hnsw_index(&self) {
        let (points, ids): (Vec<EmbeddingPoint>, Vec<String>) = self
            .vectors
            .iter()
            .map(|e| {
                (
                    EmbeddingPoint {
                        vector: e.value().vector.clone(),
                    },
                    e.key().clone(),
                )
            })
            .unzip();

        if points.is_empty() {
            *self.hnsw_index.write() = None;
            return;
        }

        let hnsw = Builder::default().ef_construction(100).build(points, ids);
        *self.hnsw_index.write() = Some(hnsw);
        log::debug!("Rebuilt HNSW index over {} vectors", self.vectors.len());
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Write the frozen graph and its header in one batch
    pub fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(
            record_key(SNAPSHOT_PREFIX, snapshot.id()).as_bytes(),
            bincode::serialize(snapshot)?,
        );
        batch.put(
            record_key(SNAPSHOT_META_PREFIX, snapshot.id()).as_bytes(),
            bincode::serialize(&snapshot.meta)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    /// Load a snapshot with its frozen graph
    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        match self.db.get(record_key(SNAPSHOT_PREFIX, id).as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every snapshot with its frozen graph, oldest first
    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .scan::<Snapshot>(SNAPSHOT_PREFIX)?
            .into_iter()
            .map(|(_, s)| s)
            .collect();
        snapshots.sort_by(|a, b| a.meta.created_at.cmp(&b.meta.created_at));
        Ok(snapshots)
    }

    /// Snapshot headers, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<SnapshotMeta> = self
            .scan::<SnapshotMeta>(SNAPSHOT_META_PREFIX)?
            .into_iter()
            .map(|(_, m)| m)
            .collect();
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let exists = self
            .db
            .get(record_key(SNAPSHOT_PREFIX, id).as_bytes())?
            .is_some();
        if exists {
            let mut batch = WriteBatch::default();
            batch.delete(record_key(SNAPSHOT_PREFIX, id).as_bytes());
            batch.delete(record_key(SNAPSHOT_META_PREFIX, id).as_bytes());
            self.db.write(batch)?;
        }
        Ok(exists)
    }

    // ---------------------------------------------------------------------
    // Export / import
    // ---------------------------------------------------------------------

    pub fn export(&self) -> Result<GraphExport> {
        let mut procedures = self.procedures();
        procedures.sort_by(|a, b| a.id.cmp(&b.id));
        let mut episodes = self.episodes();
        episodes.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(GraphExport {
            version: migration::CURRENT_VERSION,
            exported_at: Utc::now(),
            nodes: self.nodes(),
            edges: self.edges(),
            episodes,
            procedures,
            embeddings: self.embeddings(),
            pending_edges: self.pending_edges(),
            file_hashes: self.file_hashes(),
            snapshots: self.snapshots()?,
        })
    }

    /// Write every record of `export`, replacing records with the same id.
    /// Nodes keep the export's order when new to this store.
    pub fn import(&self, export: &GraphExport) -> Result<()> {
        if export.version > migration::CURRENT_VERSION {
            return Err(crate::GraphError::migration(format!(
                "export schema v{} is newer than supported v{}",
                export.version,
                migration::CURRENT_VERSION
            )));
        }

        for node in &export.nodes {
            self.put_node(node)?;
        }
        for edge in &export.edges {
            self.put_edge(edge)?;
        }
        for episode in &export.episodes {
            self.put_episode(episode)?;
        }
        for procedure in &export.procedures {
            self.put_procedure(procedure)?;
        }
        for record in &export.embeddings {
            self.put_embedding(record)?;
        }
        for pending in &export.pending_edges {
            self.put_pending(pending)?;
        }
        for entry in &export.file_hashes {
            self.put_file_hash(entry)?;
        }
        for snapshot in &export.snapshots {
            self.put_snapshot(snapshot)?;
        }
        self.flush()?;

        log::info!(
            "Imported {} nodes, {} edges, {} episodes, {} procedures, {} snapshots",
            export.nodes.len(),
            export.edges.len(),
            export.episodes.len(),
            export.procedures.len(),
            export.snapshots.len()
        );
        Ok(())
    }

    /// Get store statistics
    pub fn stats(&self) -> serde_json::Value {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for entry in self.nodes.iter() {
            *by_type
                .entry(entry.value().node_type.to_string())
                .or_insert(0) += 1;
        }

        let mut by_edge_type: HashMap<String, usize> = HashMap::new();
        for entry in self.edges.iter() {
            *by_edge_type
                .entry(entry.value().edge_type.to_string())
                .or_insert(0) += 1;
        }

        let flagged = self
            .procedures
            .iter()
            .filter(|p| p.value().flagged_for_review())
            .count();

        serde_json::json!({
            "nodes": self.nodes.len(),
            "edges": self.edges.len(),
            "episodes": self.episodes.len(),
            "procedures": self.procedures.len(),
            "flaggedProcedures": flagged,
            "pendingEdges": self.pending.len(),
            "embeddings": self.vectors.len(),
            "trackedFiles": self.file_hashes.len(),
            "nodesByType": by_type,
            "edgesByType": by_edge_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EdgeType;
    use tempfile::TempDir;

    fn node(label: &str) -> Node {
        Node::new(label, NodeType::Concept, Utc::now())
    }

    #[test]
    fn test_insertion_order_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let labels = ["zeta", "alpha", "mu", "beta"];
        {
            let store = GraphStore::open(temp_dir.path()).unwrap();
            for label in labels {
                store.put_node(&node(label)).unwrap();
            }
            // Re-putting keeps the original position
            store.put_node(&node("zeta")).unwrap();
            store.flush().unwrap();
        }

        let store = GraphStore::open(temp_dir.path()).unwrap();
        let order: Vec<String> = store.nodes().into_iter().map(|n| n.label).collect();
        assert_eq!(order, labels);

        store.put_node(&node("omega")).unwrap();
        assert_eq!(store.nodes().last().unwrap().label, "omega");
    }

    #[test]
    fn test_delete_node_removes_order_and_vector() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        let a = node("alpha");
        store.put_node(&a).unwrap();
        store
            .put_embedding(&EmbeddingRecord {
                node_id: a.id.clone(),
                provider: "test".into(),
                dimensions: 2,
                vector: vec![1.0, 0.0],
                created_at: Utc::now(),
            })
            .unwrap();

        assert!(store.delete_node(&a.id).unwrap());
        assert!(store.nodes().is_empty());
        assert!(store.get_embedding(&a.id).is_none());
        assert!(!store.delete_node(&a.id).unwrap());
    }

    #[test]
    fn test_edges_for_node_and_adjacency() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        let now = Utc::now();
        store
            .put_edge(&Edge::new("n_a", "n_b", EdgeType::Explicit, now))
            .unwrap();
        store
            .put_edge(&Edge::new("n_b", "n_c", EdgeType::CoOccurrence, now))
            .unwrap();

        assert_eq!(store.edges_for_node("n_b").len(), 2);
        assert_eq!(store.edges_for_node("n_a").len(), 1);
        let adjacency = store.adjacency();
        assert_eq!(adjacency["n_b"].len(), 2);
        assert!(!adjacency.contains_key("n_d"));
    }

    #[test]
    fn test_semantic_search_ranks_by_cosine() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        for (id, vector) in [
            ("n_x", vec![1.0, 0.0, 0.0]),
            ("n_y", vec![0.7, 0.7, 0.0]),
            ("n_z", vec![0.0, 0.0, 1.0]),
        ] {
            store
                .put_embedding(&EmbeddingRecord {
                    node_id: id.into(),
                    provider: "test".into(),
                    dimensions: 3,
                    vector,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let results = store.semantic_search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "n_x");
        assert!((results[0].1 - 1.0).abs() < 1e-5);
        assert_eq!(results[1].0, "n_y");
    }

    #[test]
    fn test_snapshot_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        let snapshot = Snapshot::capture(
            "manual",
            Default::default(),
            vec![node("alpha")],
            vec![],
            0,
            Utc::now(),
        );
        store.put_snapshot(&snapshot).unwrap();

        let loaded = store.get_snapshot(snapshot.id()).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
        assert!(store.get_snapshot("missing").unwrap().is_none());
        assert!(store.delete_snapshot(snapshot.id()).unwrap());
        assert!(store.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_listing_reads_headers_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        let now = Utc::now();
        let older = Snapshot::capture("consolidation", Default::default(), vec![node("alpha")], vec![], 0, now);
        let newer = Snapshot::capture(
            "manual",
            Default::default(),
            vec![],
            vec![],
            0,
            now + chrono::Duration::seconds(1),
        );
        store.put_snapshot(&older).unwrap();
        store.put_snapshot(&newer).unwrap();

        // A frozen graph that no longer decodes does not affect listing
        store
            .db
            .put(record_key(SNAPSHOT_PREFIX, older.id()).as_bytes(), b"garbage")
            .unwrap();

        let metas = store.list_snapshots().unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0], newer.meta);
        assert_eq!(metas[1], older.meta);
        assert_eq!(metas[1].node_count, 1);
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let store = GraphStore::open(temp_dir.path()).unwrap();
        store.put_node(&node("alpha")).unwrap();
        let stats = store.stats();
        assert_eq!(stats["nodes"], 1);
        assert_eq!(stats["nodesByType"]["concept"], 1);
    }
}

//! recall-graph
//!
//! A decaying, weighted knowledge graph built from unstructured notes and
//! conversation logs, queried with hybrid semantic and structural recall.
//!
//! ## Features
//!
//! - **Entity resolution** - mentions are matched to existing nodes by label, alias or fuzzy match
//! - **Decay & reinforcement** - edge weights fade with time and recover when seen again
//! - **Hybrid recall** - embedding similarity + graph proximity + recency + importance
//! - **Procedure learning** - lessons gain or lose confidence from feedback and get flagged for review
//! - **Snapshots** - frozen point-in-time copies of the graph with structural diffs
//! - **RocksDB persistence** - with an HNSW index over node embeddings
//!
//! ## Example
//!
//! ```ignore
//! use recall_graph::{GraphConfig, MemoryGraph, RecallOptions, SourceDocument};
//!
//! let graph = MemoryGraph::open(&db_path, GraphConfig::default())?;
//!
//! let docs = vec![SourceDocument::markdown("notes/2024-03-01.md", text)];
//! let report = graph.consolidate(&docs, &my_extractor).await?;
//!
//! let response = graph.recall("who owns billing", &RecallOptions::default()).await?;
//! for result in response.results {
//!     println!("{} {:.2}", result.label, result.score);
//! }
//! ```

pub mod config;
pub mod consolidation;
pub mod decay;
pub mod embedding;
pub mod episode;
pub mod error;
pub mod graph;
pub mod migration;
pub mod node;
pub mod procedure;
pub mod recall;
pub mod resolver;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use config::{GraphConfig, ProviderKind, RecallWeights};
pub use consolidation::{ConsolidationReport, Extractor, Section, SourceDocument};
pub use decay::DecayReport;
pub use embedding::{CachedProvider, EmbeddingProvider, HashingProvider};
pub use episode::{EntityRef, Episode, EpisodeDraft, EpisodeType, SourceType};
pub use error::{GraphError, Result};
pub use graph::{MemoryGraph, NodePatch};
pub use node::{Edge, EdgeType, Node, NodeBuilder, NodeType};
pub use procedure::{Feedback, MatchOptions, Procedure, ProcedureDraft, ProcedureMatch, ProcedureType};
pub use recall::{RecallOptions, RecallResponse, RecallResult};
pub use resolver::{EntityResolver, RawEntity, Resolution};
pub use snapshot::{Snapshot, SnapshotDiff, SnapshotMeta};
pub use storage::{GraphExport, GraphStore};

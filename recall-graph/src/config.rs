//! Engine configuration
//!
//! Every section has defaults, so a config file only needs the fields it
//! overrides. Files are JSON with camelCase keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Top-level configuration for a [`crate::MemoryGraph`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphConfig {
    pub decay: DecayConfig,
    pub resolver: ResolverConfig,
    pub consolidation: ConsolidationConfig,
    pub recall: RecallConfig,
    pub procedures: ProcedureConfig,
    pub embedding: EmbeddingConfig,
}

impl GraphConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        log::info!("Loaded graph config from {}", path.display());
        Ok(config)
    }

    /// Reject values that would break scoring or decay invariants
    pub fn validate(&self) -> Result<()> {
        let d = &self.decay;
        if !(d.decay_rate >= 0.0) || !(d.stability_boost >= 0.0) {
            return Err(GraphError::configuration(
                "decayRate and stabilityBoost must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&d.visibility_threshold) {
            return Err(GraphError::configuration(
                "visibilityThreshold must be within [0, 1]",
            ));
        }

        let r = &self.resolver;
        if !(0.0..=1.0).contains(&r.min_new_confidence) || !(0.0..=1.0).contains(&r.min_token_overlap)
        {
            return Err(GraphError::configuration(
                "resolver thresholds must be within [0, 1]",
            ));
        }

        let c = &self.consolidation;
        if c.co_occurrence_threshold == 0 {
            return Err(GraphError::configuration(
                "coOccurrenceThreshold must be at least 1",
            ));
        }
        if c.embed_concurrency == 0 {
            return Err(GraphError::configuration("embedConcurrency must be at least 1"));
        }

        let q = &self.recall;
        if q.limit == 0 || q.recency_half_life_days <= 0.0 || q.importance_saturation == 0 {
            return Err(GraphError::configuration(
                "recall limit, recencyHalfLifeDays and importanceSaturation must be positive",
            ));
        }
        q.weights.validate()?;

        let p = &self.procedures;
        if p.limit == 0 {
            return Err(GraphError::configuration("procedures.limit must be positive"));
        }

        Ok(())
    }
}

/// Edge decay parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecayConfig {
    /// Exponential rate per day, divided by edge stability
    pub decay_rate: f64,
    /// Multiplier on `ln(reinforcements + 1)` when computing stability
    pub stability_boost: f64,
    /// Edges below this weight are dormant: skipped by traversal
    pub visibility_threshold: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.05,
            stability_boost: 0.5,
            visibility_threshold: 0.1,
        }
    }
}

/// Entity resolution parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    /// Normalized mentions that never become nodes
    pub ignore: Vec<String>,
    /// Surface form (raw or normalized) to canonical label
    pub aliases: BTreeMap<String, String>,
    /// Extraction confidence a mention must exceed to mint a node
    pub min_new_confidence: f64,
    /// Strings at or below this many chars use edit distance
    pub short_form_max_len: usize,
    pub max_edit_distance: usize,
    /// Token-set Jaccard ratio for longer strings
    pub min_token_overlap: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ignore: [
                "i", "me", "we", "us", "you", "it", "this", "that", "they", "them", "the",
                "today", "yesterday", "tomorrow", "someone", "something",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            aliases: BTreeMap::new(),
            min_new_confidence: 0.5,
            short_form_max_len: 15,
            max_edit_distance: 2,
            min_token_overlap: 0.5,
        }
    }
}

/// Consolidation pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolidationConfig {
    /// Co-occurrences required before a pending edge materializes
    pub co_occurrence_threshold: u32,
    /// Excerpts and evidence are truncated to this many chars
    pub max_excerpt_chars: usize,
    /// Concurrent embedding calls in batch jobs
    pub embed_concurrency: usize,
    /// Per-call timeout for the embedding provider
    pub embed_timeout_ms: u64,
    /// Trigger tag for the snapshot taken at the end of each run
    pub snapshot_trigger: String,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            co_occurrence_threshold: 2,
            max_excerpt_chars: 280,
            embed_concurrency: 4,
            embed_timeout_ms: 10_000,
            snapshot_trigger: "consolidation".to_string(),
        }
    }
}

/// Weights of the four recall subscores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallWeights {
    pub semantic: f64,
    pub graph: f64,
    pub recency: f64,
    pub importance: f64,
}

impl RecallWeights {
    fn validate(&self) -> Result<()> {
        let all = [self.semantic, self.graph, self.recency, self.importance];
        if all.iter().any(|w| !(*w >= 0.0)) {
            return Err(GraphError::configuration("recall weights must be non-negative"));
        }
        Ok(())
    }
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            graph: 0.3,
            recency: 0.15,
            importance: 0.15,
        }
    }
}

/// Hybrid recall parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallConfig {
    pub limit: usize,
    /// Maximum traversal depth from lexical seeds
    pub hops: usize,
    /// Graph score multiplier per hop
    pub hop_decay: f64,
    pub weights: RecallWeights,
    pub recency_half_life_days: f64,
    /// Count at which the importance curve saturates
    pub importance_saturation: u32,
    /// Nearest neighbours fetched from the vector index
    pub semantic_candidates: usize,
    /// Cosine similarity a node needs to become a semantic candidate
    pub min_similarity: f64,
    pub max_connections: usize,
    pub max_episodes: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            hops: 2,
            hop_decay: 0.5,
            weights: RecallWeights::default(),
            recency_half_life_days: 30.0,
            importance_saturation: 50,
            semantic_candidates: 50,
            min_similarity: 0.25,
            max_connections: 5,
            max_episodes: 3,
        }
    }
}

/// Procedure matching defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcedureConfig {
    pub min_score: f64,
    pub limit: usize,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            min_score: 0.3,
            limit: 5,
        }
    }
}

/// Which embedding provider to construct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProviderKind {
    /// Structural-only recall
    #[default]
    None,
    /// Deterministic feature-hashing vectors, no model download
    Hashing { dimensions: usize },
    /// Local ONNX model through fastembed (requires the `fastembed` feature)
    #[serde(rename_all = "camelCase")]
    FastEmbed {
        model: String,
        #[serde(default)]
        cache_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Entries kept in the in-memory text → vector LRU; 0 disables it
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            cache_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GraphConfig::default();
        config.validate().unwrap();
        assert_eq!(config.consolidation.co_occurrence_threshold, 2);
        assert_eq!(config.procedures.min_score, 0.3);
        assert_eq!(config.procedures.limit, 5);
        assert_eq!(config.embedding.provider, ProviderKind::None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "decay": { "decayRate": 0.1 },
            "recall": { "weights": { "semantic": 1.0, "graph": 0.0 } },
            "embedding": { "provider": { "kind": "hashing", "dimensions": 64 } }
        }"#;
        let config: GraphConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.decay.decay_rate, 0.1);
        assert_eq!(config.decay.visibility_threshold, 0.1);
        assert_eq!(config.recall.weights.semantic, 1.0);
        assert_eq!(config.recall.weights.recency, 0.15);
        assert_eq!(
            config.embedding.provider,
            ProviderKind::Hashing { dimensions: 64 }
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = GraphConfig::default();
        config.recall.weights.graph = -1.0;
        assert!(matches!(
            config.validate(),
            Err(GraphError::Configuration(_))
        ));

        let mut config = GraphConfig::default();
        config.consolidation.co_occurrence_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{ "procedures": { "limit": 3 } }"#).unwrap();
        let config = GraphConfig::from_file(&path).unwrap();
        assert_eq!(config.procedures.limit, 3);
    }
}

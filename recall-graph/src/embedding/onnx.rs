//! Local ONNX embeddings through fastembed
//!
//! Models are downloaded into the discovered cache directory on first use.

use std::path::Path;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::EmbeddingProvider;
use crate::error::{GraphError, Result};

/// fastembed-backed provider (BGE-Small-EN-v1.5 by default)
pub struct FastEmbedProvider {
    model: TextEmbedding,
    name: String,
    dimensions: usize,
}

fn parse_model(name: &str) -> Result<EmbeddingModel> {
    let model = match name {
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => EmbeddingModel::AllMiniLML6V2,
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => EmbeddingModel::AllMiniLML12V2,
        "bge-small-en-v1.5" | "BGESmallENV15" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" | "BGEBaseENV15" => EmbeddingModel::BGEBaseENV15,
        "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => EmbeddingModel::NomicEmbedTextV15,
        other => {
            return Err(GraphError::configuration(format!(
                "unknown embedding model '{}'",
                other
            )))
        }
    };
    Ok(model)
}

impl FastEmbedProvider {
    /// Load `model_name`, downloading into `cache_dir` if needed
    pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self> {
        let model_id = parse_model(model_name)?;
        std::fs::create_dir_all(cache_dir)?;

        log::info!(
            "Loading fastembed model {} from {}",
            model_name,
            cache_dir.display()
        );

        let options = InitOptions::new(model_id)
            .with_cache_dir(cache_dir.to_path_buf())
            .with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| GraphError::configuration(format!("Failed to load {}: {}", model_name, e)))?;

        // Get dimension by encoding test string
        let probe = model
            .embed(vec!["test"], None)
            .map_err(|e| GraphError::configuration(format!("Failed to encode test string: {}", e)))?;
        let dimensions = probe.first().map(Vec::len).unwrap_or(0);
        if dimensions == 0 {
            return Err(GraphError::configuration(format!(
                "{} produced an empty probe embedding",
                model_name
            )));
        }

        log::info!("Loaded {} ({}d)", model_name, dimensions);

        Ok(Self {
            model,
            name: format!("fastembed/{}", model_name),
            dimensions,
        })
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.model
            .embed(vec![text], None)
            .map_err(|e| GraphError::provider(format!("Failed to encode text: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::provider("empty embedding result"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| GraphError::provider(format!("Failed to encode texts: {}", e)))
    }
}

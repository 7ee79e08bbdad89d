//! Embedding providers for semantic recall
//!
//! Providers are capabilities selected by configuration: a deterministic
//! feature-hashing provider that needs no model, and a local ONNX model via
//! fastembed behind the `fastembed` feature. Either can be wrapped in a
//! caching engine.

mod discovery;
mod engine;
#[cfg(feature = "fastembed")]
mod onnx;
mod hashing;

use std::sync::Arc;

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::error::{GraphError, Result};

pub use discovery::find_model_cache_dir;
pub use engine::CachedProvider;
#[cfg(feature = "fastembed")]
pub use onnx::FastEmbedProvider;
pub use hashing::HashingProvider;

/// Anything that can turn text into a fixed-width vector
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider name, recorded next to every stored vector
    fn name(&self) -> &str;

    /// Width of every vector this provider returns
    fn dimensions(&self) -> usize;

    /// Embed one text. Failures are per item and recoverable.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Build the provider named by `config`, or `None` for structural-only recall
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let provider: Arc<dyn EmbeddingProvider> = match &config.provider {
        ProviderKind::None => return Ok(None),
        ProviderKind::Hashing { dimensions } => {
            if *dimensions == 0 {
                return Err(GraphError::configuration(
                    "hashing provider needs at least one dimension",
                ));
            }
            Arc::new(HashingProvider::new(*dimensions))
        }
        #[cfg(feature = "fastembed")]
        ProviderKind::FastEmbed { model, cache_dir } => {
            let dir = find_model_cache_dir(cache_dir.as_deref());
            Arc::new(FastEmbedProvider::new(model, &dir)?)
        }
        #[cfg(not(feature = "fastembed"))]
        ProviderKind::FastEmbed { model, .. } => {
            return Err(GraphError::configuration(format!(
                "embedding model '{}' requires the `fastembed` feature",
                model
            )));
        }
    };

    log::info!(
        "Embedding provider ready: {} ({}d)",
        provider.name(),
        provider.dimensions()
    );

    if config.cache_capacity > 0 {
        Ok(Some(Arc::new(CachedProvider::new(provider, config.cache_capacity))))
    } else {
        Ok(Some(provider))
    }
}

/// Cosine similarity; 0 for mismatched widths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_mismatched() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_provider_from_config() {
        let none = provider_from_config(&EmbeddingConfig::default()).unwrap();
        assert!(none.is_none());

        let config = EmbeddingConfig {
            provider: ProviderKind::Hashing { dimensions: 32 },
            cache_capacity: 64,
        };
        let provider = provider_from_config(&config).unwrap().unwrap();
        assert_eq!(provider.dimensions(), 32);

        let config = EmbeddingConfig {
            provider: ProviderKind::Hashing { dimensions: 0 },
            cache_capacity: 0,
        };
        assert!(matches!(
            provider_from_config(&config),
            Err(GraphError::Configuration(_))
        ));
    }

    #[cfg(not(feature = "fastembed"))]
    #[test]
    fn test_fastembed_requires_feature() {
        let config = EmbeddingConfig {
            provider: ProviderKind::FastEmbed {
                model: "bge-small-en-v1.5".into(),
                cache_dir: None,
            },
            cache_capacity: 64,
        };
        assert!(matches!(
            provider_from_config(&config),
            Err(GraphError::Configuration(_))
        ));
    }
}

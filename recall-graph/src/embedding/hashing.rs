//! Feature-hashing embeddings
//!
//! Deterministic bag-of-words vectors: each token is hashed into a bucket
//! with a sign bit, then the vector is L2-normalized. No model files, no
//! network. Texts sharing vocabulary land close together.

use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::error::Result;

pub struct HashingProvider {
    dimensions: usize,
    name: String,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            name: format!("hashing-{}", dimensions.max(1)),
        }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(raw);
        let index = (value % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let (index, sign) = self.bucket(token);
            vector[index] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("Marcus prefers Rust").unwrap();
        let b = provider.embed("marcus PREFERS rust!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let provider = HashingProvider::new(256);
        let query = provider.embed("rust async runtime").unwrap();
        let close = provider.embed("tokio is an async runtime for rust").unwrap();
        let far = provider.embed("gardening tips for tomatoes").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let provider = HashingProvider::new(8);
        assert!(provider.embed("  ").unwrap().iter().all(|x| *x == 0.0));
        assert_eq!(provider.embed_batch(&["a", "b"]).unwrap().len(), 2);
    }
}

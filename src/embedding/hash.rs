//! Deterministic pseudo-embedding provider.
//!
//! Maps text to a fixed vector seeded by the text's hash. Identical inputs
//! always produce identical vectors; different inputs are almost certainly
//! far apart. Used by the test suites and by migration dry-runs where model
//! files are unavailable. Model identifiers follow the `hash-<dim>` naming
//! convention so the factory can resolve any dimension on demand.

use std::hash::{DefaultHasher, Hash, Hasher};

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider};

pub struct HashEmbeddingProvider {
    model: String,
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(model: &str, dimension: usize) -> Self {
        Self {
            model: model.to_string(),
            dimension,
        }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        // Salt with the model id so two hash models disagree about the same text
        self.model.hash(&mut hasher);
        let mut state = hasher.finish() | 1;

        let mut v = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            // xorshift64 keeps the sequence deterministic per (text, model)
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state >> 11) as f64 / (1u64 << 53) as f64;
            v.push((unit * 2.0 - 1.0) as f32);
        }
        Ok(l2_normalize(&v))
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

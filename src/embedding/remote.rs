//! Remote HTTP embedding provider.
//!
//! Talks to an external embedding endpoint that accepts
//! `POST { "model": ..., "input": [...] }` and answers
//! `{ "embeddings": [[f32; dim], ...] }`. Vectors are L2-normalized on
//! receipt so the rest of the engine can assume unit length.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use super::{l2_normalize, EmbeddingProvider};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct RemoteEmbeddingProvider {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl RemoteEmbeddingProvider {
    pub fn new(model: &str, url: &str, dimension: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
            dimension,
        })
    }
}

impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text])?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding endpoint returned no vectors"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .with_context(|| format!("embedding request to {} failed", self.url))?
            .error_for_status()
            .context("embedding endpoint returned an error status")?;

        let body: EmbedResponse = response
            .json()
            .context("failed to parse embedding response")?;

        anyhow::ensure!(
            body.embeddings.len() == texts.len(),
            "embedding endpoint returned {} vectors for {} inputs",
            body.embeddings.len(),
            texts.len()
        );
        for v in &body.embeddings {
            anyhow::ensure!(
                v.len() == self.dimension,
                "embedding endpoint returned dimension {}, expected {}",
                v.len(),
                self.dimension
            );
        }

        Ok(body.embeddings.iter().map(|v| l2_normalize(v)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

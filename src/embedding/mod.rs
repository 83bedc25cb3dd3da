pub mod hash;
pub mod local;
pub mod remote;

use anyhow::Result;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly `dimensions()`
/// length. All methods are synchronous — callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Identifier of the model behind this provider.
    fn model_id(&self) -> &str;
}

/// Create the provider for the configured default model.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    create_provider_for_model(&config.model, config)
}

/// Create a provider for an arbitrary model identifier.
///
/// Used by the migration controller, which needs the outgoing and incoming
/// models side by side. Resolution order:
/// - `hash-<dim>` — deterministic pseudo-embeddings (tests, demos);
/// - the configured provider kind (`local` / `remote`) for everything else.
pub fn create_provider_for_model(
    model: &str,
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    if let Some(dim) = model.strip_prefix("hash-").and_then(|d| d.parse::<usize>().ok()) {
        return Ok(Box::new(hash::HashEmbeddingProvider::new(model, dim)));
    }

    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(model, config)?;
            Ok(Box::new(provider))
        }
        "remote" => {
            let url = config.remote_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("embedding provider 'remote' requires embedding.remote_url")
            })?;
            let provider = remote::RemoteEmbeddingProvider::new(model, url, config.dimension)?;
            Ok(Box::new(provider))
        }
        "hash" => Ok(Box::new(hash::HashEmbeddingProvider::new(
            model,
            config.dimension,
        ))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, remote, hash"),
    }
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

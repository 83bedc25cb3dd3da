use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngramConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub tiers: TierConfig,
    pub retrieval: RetrievalConfig,
    pub semantic: SemanticConfig,
    pub episodic: EpisodicConfig,
    pub migration: MigrationConfig,
    pub background: BackgroundConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    /// Per-call deadline in seconds.
    pub call_deadline_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Name of the primary vector collection.
    pub collection_name: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX), `"remote"` (HTTP endpoint), or `"hash"` (deterministic, tests).
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub cache_dir: String,
    /// Required when `provider = "remote"`.
    pub remote_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TierConfig {
    /// Importance below which a short-term memory older than a day is demoted.
    pub short_term_threshold: f64,
    /// Days of zero access after which a long-term memory is archived.
    pub archival_threshold_days: u64,
    /// Days an archived memory is retained before retention expiry.
    pub archived_retention_days: u64,
    pub max_short_term: usize,
    pub max_long_term: usize,
    /// Importance decay rate per day.
    pub decay_rate: f64,
    /// Importance never decays below this floor.
    pub decay_floor: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Candidate multiplier for the vector and lexical legs.
    pub candidate_multiplier: usize,
    pub rrf_k: usize,
    /// Minimum normalized fused score, applied before re-weighting.
    pub semantic_threshold: f64,
    pub semantic_weight: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    /// When false, the lexical leg is skipped (vector-only retrieval).
    pub hybrid: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SemanticConfig {
    /// Cosine similarity at or above which a new fact/entity merges into an
    /// existing one instead of creating a new record.
    pub dedup_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EpisodicConfig {
    /// Capacity of the in-process conversation buffer.
    pub buffer_size: usize,
    /// Unreflected excerpts needed to trigger reflection generation.
    pub reflection_threshold: usize,
    pub reflection_importance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub quality_threshold: f64,
    pub rollback_threshold: f64,
    pub max_time_hours: u64,
    pub batch_size: usize,
    /// Fraction of retrievals shadowed against the secondary during CANARY.
    pub canary_fraction: f64,
    /// Probes required before the rolling quality mean is trusted.
    pub min_quality_samples: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Worker threads for the async runtime.
    pub max_workers: usize,
    /// Bound on queued access-update batches; excess batches are dropped.
    pub max_queue_size: usize,
    /// Temporal maintenance period in seconds.
    pub decay_interval_secs: u64,
    /// Access batcher flush interval in milliseconds.
    pub access_flush_ms: u64,
    /// Access batcher flush size.
    pub access_flush_size: usize,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            tiers: TierConfig::default(),
            retrieval: RetrievalConfig::default(),
            semantic: SemanticConfig::default(),
            episodic: EpisodicConfig::default(),
            migration: MigrationConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            call_deadline_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_engram_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            collection_name: "primary".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_engram_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            dimension: 384,
            cache_dir,
            remote_url: None,
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            short_term_threshold: 0.3,
            archival_threshold_days: 30,
            archived_retention_days: 365,
            max_short_term: 1000,
            max_long_term: 10000,
            decay_rate: 0.01,
            decay_floor: 0.2,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_multiplier: 4,
            rrf_k: 60,
            semantic_threshold: 0.3,
            semantic_weight: 0.6,
            recency_weight: 0.2,
            importance_weight: 0.2,
            hybrid: true,
        }
    }
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.92,
        }
    }
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            reflection_threshold: 10,
            reflection_importance: 0.7,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality_threshold: 0.75,
            rollback_threshold: 0.6,
            max_time_hours: 24,
            batch_size: 100,
            canary_fraction: 0.05,
            min_quality_samples: 50,
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 1024,
            decay_interval_secs: 60,
            access_flush_ms: 250,
            access_flush_size: 64,
        }
    }
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl EngramConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngramConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (ENGRAM_DB, ENGRAM_LOG_LEVEL,
    /// ENGRAM_EMBEDDING_PROVIDER, ENGRAM_REMOTE_EMBEDDING_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENGRAM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_REMOTE_EMBEDDING_URL") {
            self.embedding.remote_url = Some(val);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        let weight_sum = r.semantic_weight + r.recency_weight + r.importance_weight;
        anyhow::ensure!(
            (weight_sum - 1.0).abs() < 1e-6,
            "retrieval weights must sum to 1.0, got {weight_sum}"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.semantic.dedup_threshold),
            "dedup_threshold must be in [0, 1]"
        );
        anyhow::ensure!(
            self.migration.rollback_threshold <= self.migration.quality_threshold,
            "rollback_threshold must not exceed quality_threshold"
        );
        anyhow::ensure!(self.embedding.dimension > 0, "embedding dimension must be > 0");
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Path of the migration record sidecar, derived from the db path.
    pub fn migration_sidecar_path(&self) -> PathBuf {
        let mut p = self.resolved_db_path();
        p.set_extension("migration.json");
        p
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngramConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.tiers.max_short_term, 1000);
        assert_eq!(config.semantic.dedup_threshold, 0.92);
        assert!(config.storage.db_path.ends_with("memory.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"
collection_name = "mem_v1"

[retrieval]
top_k = 10

[migration]
batch_size = 50
"#;
        let config: EngramConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.storage.collection_name, "mem_v1");
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.migration.batch_size, 50);
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.tiers.archival_threshold_days, 30);
    }

    #[test]
    fn weight_validation_rejects_bad_sum() {
        let mut config = EngramConfig::default();
        config.retrieval.recency_weight = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sidecar_path_derived_from_db_path() {
        let mut config = EngramConfig::default();
        config.storage.db_path = "/tmp/engram/memory.db".into();
        assert_eq!(
            config.migration_sidecar_path(),
            PathBuf::from("/tmp/engram/memory.migration.json")
        );
    }
}

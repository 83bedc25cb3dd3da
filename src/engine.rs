//! Domain manager — the façade over persistence, temporal, semantic, and
//! episodic concerns, plus the migration controller.
//!
//! The engine owns the process-wide singletons (database handle, embedding
//! providers, access batcher, episodic buffer, migration controller) and the
//! lifecycle state machine:
//!
//! `starting → transport_ready → warming → ready → draining → stopped`, with
//! `failed` absorbing from any non-terminal state.
//!
//! The transport can list tools as soon as the process starts; the engine
//! answers `INITIALIZING` until warming finishes, so slow model loads never
//! block the handshake.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::EngramConfig;
use crate::db;
use crate::db::{collections, migrations};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{EngramError, Result};
use crate::memory::access::AccessBatcher;
use crate::memory::episodic::{EpisodicBuffer, ExtractiveSummarizer, ReflectionGenerator};
use crate::memory::search::{self, RetrievalFilter, RetrievalParams, ScoredMemory};
use crate::memory::stats::StatsResponse;
use crate::memory::store::{self, StoreOutcome};
use crate::memory::types::{sanitize_text, Memory, MemoryContent, MemoryType, Tier};
use crate::memory::update::{self, MemoryPatch};
use crate::memory::{forget, stats, tiers, CollectionWrite};
use crate::migration::state::MigrationRecord;
use crate::migration::MigrationController;

/// Engine lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    TransportReady,
    Warming,
    Ready,
    Draining,
    Stopped,
    Failed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::TransportReady => "transport_ready",
            Self::Warming => "warming",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Everything that exists only after warming completes.
struct EngineCore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    providers: Mutex<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    batcher: AccessBatcher,
    batcher_handle: Mutex<Option<JoinHandle<()>>>,
    episodic: EpisodicBuffer,
    reflector: Box<dyn ReflectionGenerator>,
    migration: MigrationController,
}

/// The domain manager.
pub struct Engine {
    config: Arc<EngramConfig>,
    lifecycle: RwLock<Lifecycle>,
    core: RwLock<Option<Arc<EngineCore>>>,
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Arguments for `store_memory`, already transport-validated.
#[derive(Debug)]
pub struct StoreRequest {
    pub memory_type: String,
    pub content: serde_json::Value,
    pub importance: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub source: Option<String>,
}

/// Arguments for `retrieve_memory`.
#[derive(Debug)]
pub struct RetrieveRequest {
    pub query: String,
    pub limit: Option<usize>,
    pub types: Option<Vec<String>>,
    pub min_similarity: Option<f64>,
}

/// Arguments for `update_memory`.
#[derive(Debug)]
pub struct UpdateRequest {
    pub id: String,
    pub content: Option<serde_json::Value>,
    pub importance: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub results: Vec<ScoredMemory>,
}

impl Engine {
    pub fn new(config: EngramConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            lifecycle: RwLock::new(Lifecycle::Starting),
            core: RwLock::new(None),
            maintenance_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().expect("lifecycle lock poisoned")
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        let mut state = self.lifecycle.write().expect("lifecycle lock poisoned");
        tracing::info!(from = state.as_str(), to = next.as_str(), "lifecycle transition");
        *state = next;
    }

    /// Transport handshake is done; tool listing is now served.
    pub fn mark_transport_ready(&self) {
        self.set_lifecycle(Lifecycle::TransportReady);
    }

    /// Absorbing failure state. Subsequent calls answer `INTERNAL`.
    pub fn fail(&self, detail: &str) {
        tracing::error!(detail, "engine entering failed state");
        self.set_lifecycle(Lifecycle::Failed);
    }

    /// Open the backend, load providers, recover any interrupted migration,
    /// and start the background loops. Runs in the background after the
    /// transport is already serving the tool list.
    pub async fn warm(self: &Arc<Self>) -> Result<()> {
        self.set_lifecycle(Lifecycle::Warming);

        let config = Arc::clone(&self.config);
        let seed = match tokio::task::spawn_blocking(move || build_core(&config))
            .await
            .map_err(|e| EngramError::internal(format!("warming task: {e}")))?
        {
            Ok(seed) => seed,
            Err(e) => {
                self.fail(&format!("warming failed: {e}"));
                return Err(e);
            }
        };

        // The batcher needs the runtime, so it spawns here rather than in
        // build_core.
        let (batcher, batcher_handle) = AccessBatcher::spawn(
            Arc::clone(&seed.db),
            Duration::from_millis(self.config.background.access_flush_ms),
            self.config.background.access_flush_size,
            self.config.background.max_queue_size,
        );
        let core = Arc::new(EngineCore::from_seed(seed, batcher, batcher_handle));

        *self.core.write().expect("core lock poisoned") = Some(Arc::clone(&core));
        self.set_lifecycle(Lifecycle::Ready);

        let handle = spawn_maintenance_loop(Arc::clone(self), core);
        *self
            .maintenance_handle
            .lock()
            .expect("maintenance handle lock poisoned") = Some(handle);

        tracing::info!("engine ready");
        Ok(())
    }

    /// Shutdown: stop accepting calls, drain the batcher, stop the loops.
    pub async fn drain(&self) {
        self.set_lifecycle(Lifecycle::Draining);

        if let Some(handle) = self
            .maintenance_handle
            .lock()
            .expect("maintenance handle lock poisoned")
            .take()
        {
            handle.abort();
        }

        let core = self.core.read().expect("core lock poisoned").clone();
        if let Some(core) = core {
            core.batcher.flush().await;
            if let Some(handle) = core
                .batcher_handle
                .lock()
                .expect("batcher handle lock poisoned")
                .take()
            {
                handle.abort();
            }
        }

        self.set_lifecycle(Lifecycle::Stopped);
        tracing::info!("engine stopped");
    }

    fn ready_core(&self) -> Result<Arc<EngineCore>> {
        match self.lifecycle() {
            Lifecycle::Ready => {}
            Lifecycle::Starting | Lifecycle::TransportReady | Lifecycle::Warming => {
                return Err(EngramError::Initializing(
                    self.lifecycle().as_str().to_string(),
                ));
            }
            Lifecycle::Draining => return Err(EngramError::Draining),
            Lifecycle::Stopped | Lifecycle::Failed => {
                return Err(EngramError::internal("engine is not serving"));
            }
        }
        self.core
            .read()
            .expect("core lock poisoned")
            .clone()
            .ok_or_else(|| EngramError::internal("ready without core"))
    }

    // ── Tool operations ──────────────────────────────────────────────────

    pub async fn store(&self, request: StoreRequest) -> Result<StoreOutcome> {
        let core = self.ready_core()?;

        let memory_type: MemoryType = request.memory_type.parse()?;
        let content = MemoryContent::parse(memory_type, request.content)?;
        let importance = match request.importance {
            Some(i) if !(0.0..=1.0).contains(&i) => {
                return Err(EngramError::invalid_arguments(
                    "importance must be in [0, 1]",
                ));
            }
            Some(i) => i,
            None => 0.5,
        };
        let tags = parse_tags(request.tags)?;
        let source = request
            .source
            .as_deref()
            .map(sanitize_text)
            .transpose()?;

        let writes = self.embeddings_for(&core, &content.projection()).await?;
        let dedup_threshold = self.config.semantic.dedup_threshold;

        let db = Arc::clone(&core.db);
        let content_clone = content.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            store::store_memory(
                &mut conn,
                &content_clone,
                importance,
                &tags,
                source.as_deref(),
                &writes,
                dedup_threshold,
            )
        })
        .await
        .map_err(|e| EngramError::internal(format!("store task: {e}")))??;

        tracing::info!(id = %outcome.id, merged = outcome.merged, type_ = %memory_type, "memory stored");

        // Episodic hook: buffer the excerpt and maybe consolidate
        if memory_type == MemoryType::Conversation && !outcome.merged {
            let due = core.episodic.record(&outcome.id, &content.projection());
            if due {
                if let Err(e) = self.generate_reflection(&core).await {
                    tracing::warn!(error = %e, "reflection generation failed; excerpts retained");
                }
            }
        }

        Ok(outcome)
    }

    pub async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrieveResponse> {
        let core = self.ready_core()?;

        if request.query.trim().is_empty() {
            return Err(EngramError::invalid_arguments("query must not be empty"));
        }
        let limit = request.limit.unwrap_or(self.config.retrieval.top_k).clamp(1, 100);
        let types = request
            .types
            .map(|ts| {
                ts.iter()
                    .map(|t| t.parse::<MemoryType>())
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let mut params = RetrievalParams::from_config(&self.config.retrieval, limit);
        if let Some(min) = request.min_similarity {
            if !(0.0..=1.0).contains(&min) {
                return Err(EngramError::invalid_arguments(
                    "min_similarity must be in [0, 1]",
                ));
            }
            params.semantic_threshold = min;
        }
        let filter = RetrievalFilter {
            types,
            ..Default::default()
        };

        let query = request.query.clone();

        // The active collection decides which model embeds the query; during
        // FULL the pointer is on the secondary collection and its model.
        let db = Arc::clone(&core.db);
        let active = tokio::task::spawn_blocking(move || -> Result<collections::CollectionInfo> {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            let name = migrations::get_active_collection(&conn)
                .map_err(EngramError::from)?
                .ok_or_else(|| EngramError::internal("no active collection"))?;
            collections::info(&conn, &name)
        })
        .await
        .map_err(|e| EngramError::internal(format!("retrieve task: {e}")))??;

        let query_embedding = self.embed_with(&core, &active.model, &query).await?;

        let db = Arc::clone(&core.db);
        let filter_clone = filter.clone();
        let params_clone = params.clone();
        let query_clone = query.clone();
        let collection = active.name.clone();
        let results = tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            search::retrieve(
                &conn,
                &collection,
                &query_embedding,
                &query_clone,
                &filter_clone,
                &params_clone,
                chrono::Utc::now(),
            )
        })
        .await
        .map_err(|e| EngramError::internal(format!("retrieve task: {e}")))??;

        // Probe harvesting + canary shadowing
        core.migration.probes.push(&query);
        if let Some((canary_collection, canary_model)) = core.migration.canary_target() {
            let sampled = rand::rng().random::<f64>() < core.migration.canary_fraction();
            if sampled {
                if let Err(e) = self
                    .run_canary_probe(&core, &query, &filter, &params, &results, &canary_collection, &canary_model)
                    .await
                {
                    tracing::debug!(error = %e, "canary probe failed");
                }
            }
        }

        // Access side-effects for consumed results
        let ids: Vec<String> = results.iter().map(|r| r.memory.id.clone()).collect();
        core.batcher.touch_all(ids);

        Ok(RetrieveResponse { results })
    }

    pub async fn get(&self, id: String) -> Result<Memory> {
        let core = self.ready_core()?;
        let db = Arc::clone(&core.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            store::get_memory(&conn, &id)
        })
        .await
        .map_err(|e| EngramError::internal(format!("get task: {e}")))?
    }

    pub async fn list(
        &self,
        types: Option<Vec<String>>,
        tier: Option<String>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<search::ListPage> {
        let core = self.ready_core()?;
        let types = types
            .map(|ts| {
                ts.iter()
                    .map(|t| t.parse::<MemoryType>())
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let tier = tier.map(|t| t.parse::<Tier>()).transpose()?;
        let limit = limit.unwrap_or(20).clamp(1, 200);
        let offset = offset.unwrap_or(0);

        let db = Arc::clone(&core.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            search::list_memories(&conn, types.as_deref(), tier, None, limit, offset)
        })
        .await
        .map_err(|e| EngramError::internal(format!("list task: {e}")))?
    }

    pub async fn update(&self, request: UpdateRequest) -> Result<Memory> {
        let core = self.ready_core()?;

        let existing = self.get(request.id.clone()).await?;
        let content = request
            .content
            .map(|c| MemoryContent::parse(existing.memory_type, c))
            .transpose()?;
        if let Some(i) = request.importance {
            if !(0.0..=1.0).contains(&i) {
                return Err(EngramError::invalid_arguments(
                    "importance must be in [0, 1]",
                ));
            }
        }

        let writes = match &content {
            Some(content) => Some(self.embeddings_for(&core, &content.projection()).await?),
            None => None,
        };
        let patch = MemoryPatch {
            content,
            importance: request.importance,
            tags: request.tags.map(|t| parse_tags(Some(t))).transpose()?,
            source: request
                .source
                .as_deref()
                .map(sanitize_text)
                .transpose()?,
        };

        let db = Arc::clone(&core.db);
        let dedup_threshold = self.config.semantic.dedup_threshold;
        let id = request.id;
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            update::update_memory(&mut conn, &id, &patch, writes.as_deref(), dedup_threshold)
        })
        .await
        .map_err(|e| EngramError::internal(format!("update task: {e}")))?
    }

    pub async fn delete(&self, id: String) -> Result<bool> {
        let core = self.ready_core()?;
        let db = Arc::clone(&core.db);
        let deleted = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            forget::delete_memory(&mut conn, &id)
        })
        .await
        .map_err(|e| EngramError::internal(format!("delete task: {e}")))??;
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let core = self.ready_core()?;
        let db = Arc::clone(&core.db);
        let db_path = core.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            stats::memory_stats(&conn, Some(&db_path))
        })
        .await
        .map_err(|e| EngramError::internal(format!("stats task: {e}")))?
    }

    // ── Migration tools ──────────────────────────────────────────────────

    pub async fn migration_start(&self, target_model: String) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        if !self.config.migration.enabled {
            return Err(EngramError::invalid_arguments(
                "migration is disabled in configuration",
            ));
        }
        // Resolve the provider first so the dimension is known and a bogus
        // model fails before any state changes.
        let provider = self.provider_for(&core, &target_model)?;
        let dimension = provider.dimensions();

        let db = Arc::clone(&core.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            core.migration.start(&conn, &target_model, dimension)
        })
        .await
        .map_err(|e| EngramError::internal(format!("migration task: {e}")))?
    }

    pub async fn migration_status(&self) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        Ok(core.migration.status())
    }

    pub async fn migration_advance(&self) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        let status = core.migration.status();
        let secondary_provider = status
            .secondary_model
            .as_deref()
            .map(|m| self.provider_for(&core, m))
            .transpose()?;

        let db = Arc::clone(&core.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            core.migration
                .advance(&conn, secondary_provider.as_deref())
        })
        .await
        .map_err(|e| EngramError::internal(format!("migration task: {e}")))?
    }

    pub async fn migration_pause(&self) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        core.migration.pause()
    }

    pub async fn migration_resume(&self) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        core.migration.resume()
    }

    pub async fn migration_rollback(&self) -> Result<MigrationRecord> {
        let core = self.ready_core()?;
        let db = Arc::clone(&core.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            core.migration.rollback(&conn, "operator_request")
        })
        .await
        .map_err(|e| EngramError::internal(format!("migration task: {e}")))?
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn provider_for(
        &self,
        core: &EngineCore,
        model: &str,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let mut providers = core.providers.lock().expect("provider lock poisoned");
        if let Some(provider) = providers.get(model) {
            return Ok(Arc::clone(provider));
        }
        let provider = embedding::create_provider_for_model(model, &self.config.embedding)
            .map_err(|e| EngramError::invalid_arguments(format!("embedding model: {e}")))?;
        let provider: Arc<dyn EmbeddingProvider> = Arc::from(provider);
        providers.insert(model.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    async fn embed_with(
        &self,
        core: &EngineCore,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>> {
        let provider = self.provider_for(core, model)?;
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            provider
                .embed(&text)
                .map_err(|e| EngramError::backend(format!("embedding: {e}")))
        })
        .await
        .map_err(|e| EngramError::internal(format!("embed task: {e}")))?
    }

    /// Primary embedding plus, while dual-writes are live, the secondary one.
    async fn embeddings_for(
        &self,
        core: &Arc<EngineCore>,
        projection: &str,
    ) -> Result<Vec<CollectionWrite>> {
        let status = core.migration.status();
        let mut writes = vec![CollectionWrite {
            collection: status.primary_collection.clone(),
            model: status.primary_model.clone(),
            embedding: self
                .embed_with(core, &status.primary_model, projection)
                .await?,
        }];
        if let Some((collection, model)) = core.migration.dual_write_target() {
            writes.push(CollectionWrite {
                embedding: self.embed_with(core, &model, projection).await?,
                collection,
                model,
            });
        }
        Ok(writes)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_canary_probe(
        &self,
        core: &Arc<EngineCore>,
        query: &str,
        filter: &RetrievalFilter,
        params: &RetrievalParams,
        primary_results: &[ScoredMemory],
        canary_collection: &str,
        canary_model: &str,
    ) -> Result<()> {
        let query_embedding = self.embed_with(core, canary_model, query).await?;
        let db = Arc::clone(&core.db);
        let filter = filter.clone();
        let params = params.clone();
        let query = query.to_string();
        let collection = canary_collection.to_string();
        let secondary = tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            search::retrieve(
                &conn,
                &collection,
                &query_embedding,
                &query,
                &filter,
                &params,
                chrono::Utc::now(),
            )
        })
        .await
        .map_err(|e| EngramError::internal(format!("canary task: {e}")))??;

        let primary_hits: Vec<(String, f64)> = primary_results
            .iter()
            .map(|r| (r.memory.id.clone(), r.score))
            .collect();
        let secondary_hits: Vec<(String, f64)> = secondary
            .iter()
            .map(|r| (r.memory.id.clone(), r.score))
            .collect();
        let score = core.migration.record_probe(&primary_hits, &secondary_hits);
        tracing::debug!(score, "canary probe recorded");
        Ok(())
    }

    /// Consolidation: distill the unreflected excerpts into a reflection
    /// memory carrying weak refs back to its sources.
    async fn generate_reflection(&self, core: &Arc<EngineCore>) -> Result<()> {
        let excerpts = core.episodic.unreflected();
        if excerpts.is_empty() {
            return Ok(());
        }
        let body = core
            .reflector
            .reflect(&excerpts)
            .map_err(|e| EngramError::internal(format!("reflection generator: {e}")))?;
        let refs: Vec<String> = excerpts.iter().map(|e| e.memory_id.clone()).collect();

        let content = MemoryContent::parse(
            MemoryType::Reflection,
            serde_json::json!({ "body": body, "refs": refs }),
        )?;
        let writes = self.embeddings_for(core, &content.projection()).await?;
        let importance = self.config.episodic.reflection_importance;
        let dedup_threshold = self.config.semantic.dedup_threshold;

        let db = Arc::clone(&core.db);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|e| {
                EngramError::internal(format!("db lock poisoned: {e}"))
            })?;
            store::store_memory(
                &mut conn,
                &content,
                importance,
                &BTreeSet::new(),
                Some("consolidation"),
                &writes,
                dedup_threshold,
            )
        })
        .await
        .map_err(|e| EngramError::internal(format!("reflection task: {e}")))??;

        core.episodic.mark_reflected(&refs);
        tracing::info!(id = %outcome.id, sources = refs.len(), "reflection stored");
        Ok(())
    }
}

/// Blocking half of warming: open the database, construct the migration
/// controller, and resolve the primary embedding provider eagerly so a
/// missing model surfaces here rather than on the first call.
fn build_core(config: &EngramConfig) -> Result<EngineCoreSeed> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(
        &db_path,
        &config.storage.collection_name,
        &config.embedding.model,
        config.embedding.dimension,
    )
    .map_err(|e| EngramError::backend(format!("open database: {e}")))?;

    let migration = MigrationController::new(
        config.migration_sidecar_path(),
        config.migration.clone(),
        &config.embedding.model,
        &config.storage.collection_name,
    )?;
    migration.recover(&conn)?;

    let primary_model = migration.primary_model();
    let provider = embedding::create_provider_for_model(&primary_model, &config.embedding)
        .map_err(|e| EngramError::backend(format!("embedding provider: {e}")))?;
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(provider);
    let mut providers: HashMap<String, Arc<dyn EmbeddingProvider>> = HashMap::new();
    providers.insert(primary_model, provider);

    Ok(EngineCoreSeed {
        db: Arc::new(Mutex::new(conn)),
        db_path,
        providers: Mutex::new(providers),
        episodic: EpisodicBuffer::new(
            config.episodic.buffer_size,
            config.episodic.reflection_threshold,
        ),
        reflector: Box::new(ExtractiveSummarizer),
        migration,
    })
}

/// Intermediate between `build_core` (blocking, no runtime) and the full
/// [`EngineCore`] (needs the runtime for the batcher task).
struct EngineCoreSeed {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    providers: Mutex<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    episodic: EpisodicBuffer,
    reflector: Box<dyn ReflectionGenerator>,
    migration: MigrationController,
}

impl EngineCore {
    fn from_seed(seed: EngineCoreSeed, batcher: AccessBatcher, handle: JoinHandle<()>) -> Self {
        Self {
            db: seed.db,
            db_path: seed.db_path,
            providers: seed.providers,
            batcher,
            batcher_handle: Mutex::new(Some(handle)),
            episodic: seed.episodic,
            reflector: seed.reflector,
            migration: seed.migration,
        }
    }
}

/// Background loop: temporal maintenance plus migration ticks. A backend
/// that stays unreachable for over a minute flips the engine to `failed`.
fn spawn_maintenance_loop(engine: Arc<Engine>, core: Arc<EngineCore>) -> JoinHandle<()> {
    let interval = Duration::from_secs(engine.config.background.decay_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failing_since: Option<std::time::Instant> = None;

        loop {
            ticker.tick().await;

            let config = Arc::clone(&engine.config);
            let db = Arc::clone(&core.db);
            let core_ref = Arc::clone(&core);
            let status = core.migration.status();
            let secondary_provider = status
                .secondary_model
                .as_deref()
                .and_then(|m| engine.provider_for(&core, m).ok());

            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                let mut conn = db.lock().map_err(|e| {
                    EngramError::internal(format!("db lock poisoned: {e}"))
                })?;
                let params = tiers::TierParams::from_config(&config.tiers);
                tiers::run_cycle(&mut conn, &params, chrono::Utc::now())?;
                core_ref.migration.tick(
                    &mut conn,
                    secondary_provider.as_deref(),
                    chrono::Utc::now(),
                )?;
                Ok(())
            })
            .await;

            match result {
                Ok(Ok(())) => failing_since = None,
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(error = %e, "maintenance cycle failed");
                    let since = failing_since.get_or_insert_with(std::time::Instant::now);
                    if since.elapsed() > Duration::from_secs(60) {
                        engine.fail("backend unreachable for over 60s");
                        return;
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "maintenance cycle error");
                    failing_since = None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "maintenance task panicked");
                    engine.fail("maintenance task panicked");
                    return;
                }
            }
        }
    })
}

fn parse_tags(tags: Option<Vec<String>>) -> Result<BTreeSet<String>> {
    let Some(tags) = tags else {
        return Ok(BTreeSet::new());
    };
    let mut set = BTreeSet::new();
    for tag in tags {
        let tag = sanitize_text(&tag)?;
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            continue;
        }
        if tag.len() > 128 {
            return Err(EngramError::invalid_arguments("tag exceeds 128 bytes"));
        }
        set.insert(tag);
    }
    Ok(set)
}

pub mod delete_memory;
pub mod list_memories;
pub mod memory_stats;
pub mod migration;
pub mod retrieve_memory;
pub mod store_memory;
pub mod update_memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use delete_memory::DeleteMemoryParams;
use list_memories::ListMemoriesParams;
use memory_stats::MemoryStatsParams;
use migration::{MigrationControlParams, MigrationStartParams};
use retrieve_memory::RetrieveMemoryParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;
use store_memory::StoreMemoryParams;
use update_memory::UpdateMemoryParams;

use crate::engine::{Engine, RetrieveRequest, StoreRequest, UpdateRequest};
use crate::error::EngramError;

/// The MCP tool handler. Holds the engine façade and exposes all tools via
/// the `#[tool_router]` macro. The router's tool list is static, so the
/// transport can enumerate tools while the engine is still warming.
#[derive(Clone)]
pub struct EngramTools {
    tool_router: ToolRouter<Self>,
    engine: Arc<Engine>,
}

impl EngramTools {
    /// Run an engine operation under the per-call deadline and serialize the
    /// outcome for the transport.
    async fn reply<T, F>(&self, operation: F) -> std::result::Result<String, String>
    where
        T: Serialize,
        F: Future<Output = crate::error::Result<T>>,
    {
        let deadline = Duration::from_secs(self.engine.config().server.call_deadline_secs);
        let result = match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(EngramError::Timeout),
        };
        match result {
            Ok(value) => serde_json::to_string(&value)
                .map_err(|e| EngramError::internal(format!("serialize response: {e}")).to_rpc_json()),
            Err(e) => Err(e.to_rpc_json()),
        }
    }
}

#[derive(Serialize)]
struct RetrieveItem {
    id: String,
    memory: crate::memory::types::Memory,
    score: f64,
}

#[derive(Serialize)]
struct RetrieveReply {
    results: Vec<RetrieveItem>,
}

#[derive(Serialize)]
struct IdReply {
    id: String,
}

#[derive(Serialize)]
struct DeleteReply {
    deleted: bool,
}

#[tool_router]
impl EngramTools {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
        }
    }

    /// Store a typed memory record.
    #[tool(
        description = "Store a memory. Types: fact (statements), entity (people/places/things), conversation (chat excerpts), reflection (summaries), code (snippets). Near-duplicate facts and entities are merged and the existing id returned."
    )]
    async fn store_memory(
        &self,
        Parameters(params): Parameters<StoreMemoryParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.store(StoreRequest {
            memory_type: params.r#type,
            content: params.content,
            importance: params.importance,
            tags: params.tags,
            source: params.source,
        }))
        .await
    }

    /// Retrieve memories by semantic + lexical similarity.
    #[tool(
        description = "Search memories with hybrid vector + keyword retrieval, re-ranked by recency and importance. Returned memories count as accessed."
    )]
    async fn retrieve_memory(
        &self,
        Parameters(params): Parameters<RetrieveMemoryParams>,
    ) -> std::result::Result<String, String> {
        let request = RetrieveRequest {
            query: params.query,
            limit: params.limit,
            types: params.types,
            min_similarity: params.min_similarity,
        };
        self.reply(async {
            let response = self.engine.retrieve(request).await?;
            Ok(RetrieveReply {
                results: response
                    .results
                    .into_iter()
                    .map(|r| RetrieveItem {
                        id: r.memory.id.clone(),
                        score: r.score,
                        memory: r.memory,
                    })
                    .collect(),
            })
        })
        .await
    }

    /// List memories with filters and pagination.
    #[tool(description = "List memories by type and tier with pagination. Newest first.")]
    async fn list_memories(
        &self,
        Parameters(params): Parameters<ListMemoriesParams>,
    ) -> std::result::Result<String, String> {
        self.reply(
            self.engine
                .list(params.types, params.tier, params.limit, params.offset),
        )
        .await
    }

    /// Patch an existing memory.
    #[tool(
        description = "Update a memory's content, importance, tags, or source. Content must keep the record's type shape."
    )]
    async fn update_memory(
        &self,
        Parameters(params): Parameters<UpdateMemoryParams>,
    ) -> std::result::Result<String, String> {
        let request = UpdateRequest {
            id: params.id,
            content: params.patch.content,
            importance: params.patch.importance,
            tags: params.patch.tags,
            source: params.patch.source,
        };
        self.reply(async {
            let memory = self.engine.update(request).await?;
            Ok(IdReply { id: memory.id })
        })
        .await
    }

    /// Delete a memory by id.
    #[tool(description = "Delete a memory by id. Idempotent: deleting an absent id reports deleted=false.")]
    async fn delete_memory(
        &self,
        Parameters(params): Parameters<DeleteMemoryParams>,
    ) -> std::result::Result<String, String> {
        self.reply(async {
            let deleted = self.engine.delete(params.id).await?;
            Ok(DeleteReply { deleted })
        })
        .await
    }

    /// Storage statistics.
    #[tool(description = "Memory store statistics: counts by type and tier, index sizes.")]
    async fn memory_stats(
        &self,
        Parameters(_params): Parameters<MemoryStatsParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.stats()).await
    }

    /// Begin an embedding model migration.
    #[tool(
        description = "Start a zero-downtime migration to a new embedding model. Creates the secondary collection and enters PREPARATION."
    )]
    async fn migration_start(
        &self,
        Parameters(params): Parameters<MigrationStartParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_start(params.target_model))
            .await
    }

    /// Current migration state snapshot.
    #[tool(description = "Current migration state, progress, and quality metrics.")]
    async fn migration_status(
        &self,
        Parameters(_params): Parameters<MigrationControlParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_status()).await
    }

    /// Advance the migration one state.
    #[tool(
        description = "Advance the migration one state. GRADUAL->FULL is gated on full coverage and the quality threshold."
    )]
    async fn migration_advance(
        &self,
        Parameters(_params): Parameters<MigrationControlParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_advance()).await
    }

    /// Pause the migration.
    #[tool(description = "Pause an active migration. Idempotent.")]
    async fn migration_pause(
        &self,
        Parameters(_params): Parameters<MigrationControlParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_pause()).await
    }

    /// Resume a paused migration.
    #[tool(description = "Resume a paused migration. Idempotent.")]
    async fn migration_resume(
        &self,
        Parameters(_params): Parameters<MigrationControlParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_resume()).await
    }

    /// Roll the migration back.
    #[tool(
        description = "Roll back an active migration: drop the secondary collection and restore the primary."
    )]
    async fn migration_rollback(
        &self,
        Parameters(_params): Parameters<MigrationControlParams>,
    ) -> std::result::Result<String, String> {
        self.reply(self.engine.migration_rollback()).await
    }
}

#[tool_handler]
impl ServerHandler for EngramTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Engram is a persistent memory engine. Use store_memory to save typed \
                 memories, retrieve_memory for hybrid semantic search, and the \
                 migration_* tools to manage embedding model migrations."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

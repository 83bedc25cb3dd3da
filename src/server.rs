//! MCP server initialization for the stdio transport.
//!
//! Wires the engine façade and the tool handler into a running server. The
//! tool list is served from the static router as soon as the handshake
//! completes; the engine warms in the background, so a slow embedding model
//! load never delays tool enumeration.

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

use crate::config::EngramConfig;
use crate::engine::{Engine, Lifecycle};
use crate::tools::EngramTools;

/// Start the MCP server over stdio transport. Returns after the client
/// disconnects and the engine has drained.
pub async fn serve_stdio(config: EngramConfig) -> Result<()> {
    tracing::info!("starting engram MCP server on stdio");

    let engine = Engine::new(config);
    let tools = EngramTools::new(Arc::clone(&engine));
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    engine.mark_transport_ready();
    tracing::info!("MCP transport ready — tool list is being served");

    // Background warming: open the backend and load the embedding model.
    // Tool calls answer INITIALIZING until this finishes.
    let warming = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = warming.warm().await {
            tracing::error!(error = %e, "engine warming failed");
        }
    });

    server.waiting().await?;
    tracing::info!("MCP client disconnected, draining");

    let failed = engine.lifecycle() == Lifecycle::Failed;
    engine.drain().await;

    if failed {
        tracing::error!("engine was in failed state; exiting with code 2");
        std::process::exit(2);
    }
    tracing::info!("MCP server shut down");
    Ok(())
}

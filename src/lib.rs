//! Persistent memory for conversational assistants — typed records, tiered
//! storage, hybrid retrieval, and zero-downtime embedding migration, exposed
//! as an [MCP](https://modelcontextprotocol.io/) tool server over stdio.
//!
//! Memories come in five types (`fact`, `entity`, `conversation`,
//! `reflection`, `code`) and move between three storage tiers (`short_term`,
//! `long_term`, `archived`) under importance decay and access pressure.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for BM25 keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search;
//!   one vec0 virtual table per vector collection
//! - **Embeddings**: local ONNX Runtime (all-MiniLM-L6-v2 by default) or a
//!   remote HTTP endpoint
//! - **Retrieval**: hybrid vector + BM25 merged via Reciprocal Rank Fusion,
//!   re-weighted by recency and importance
//! - **Migration**: dual-collection state machine with canary quality gates
//!   and rollback, for swapping the embedding model without downtime
//! - **Transport**: MCP over stdio
//!
//! # Modules
//!
//! - [`config`] — configuration from TOML files and environment variables
//! - [`db`] — SQLite initialization, schema, vector collections, health
//! - [`embedding`] — text-to-vector providers
//! - [`engine`] — domain manager façade and lifecycle
//! - [`memory`] — store, retrieve, tiers, episodic buffer, stats
//! - [`migration`] — the dual-collection migration controller

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod migration;
pub mod server;
pub mod tools;

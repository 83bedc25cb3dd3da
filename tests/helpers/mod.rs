#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use engram::config::EngramConfig;
use engram::db::{self, collections, migrations};
use engram::engine::Engine;
use engram::memory::store::store_memory;
use engram::memory::types::{MemoryContent, MemoryType};
use engram::memory::CollectionWrite;
use rusqlite::Connection;

pub const TEST_DIM: usize = 16;

/// In-memory database with a 16-dimension primary collection, so tests get
/// up to 16 mutually orthogonal fixture vectors.
pub fn test_conn() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    collections::create(&conn, "primary", "hash-16", TEST_DIM).unwrap();
    migrations::set_active_collection(&conn, "primary").unwrap();
    conn
}

/// Unit vector along the given axis.
pub fn test_embedding(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_DIM];
    v[axis % TEST_DIM] = 1.0;
    v
}

pub fn fact(statement: &str) -> MemoryContent {
    MemoryContent::parse(
        MemoryType::Fact,
        serde_json::json!({ "statement": statement }),
    )
    .unwrap()
}

pub fn conversation(text: &str) -> MemoryContent {
    MemoryContent::parse(
        MemoryType::Conversation,
        serde_json::json!({ "messages": [{ "role": "user", "text": text }] }),
    )
    .unwrap()
}

/// Insert a memory through the real write path.
pub fn insert_memory(
    conn: &mut Connection,
    content: &MemoryContent,
    importance: f64,
    embedding: &[f32],
) -> String {
    store_memory(
        conn,
        content,
        importance,
        &BTreeSet::new(),
        None,
        &[CollectionWrite {
            collection: "primary".into(),
            model: "hash-16".into(),
            embedding: embedding.to_vec(),
        }],
        0.92,
    )
    .unwrap()
    .id
}

/// Config for engine-level tests: temp-dir database, deterministic hash
/// embeddings, fast access flushes, quiet background loop.
pub fn test_config(dir: &tempfile::TempDir) -> EngramConfig {
    let mut config = EngramConfig::default();
    config.storage.db_path = dir
        .path()
        .join("memory.db")
        .to_string_lossy()
        .into_owned();
    config.embedding.provider = "hash".into();
    config.embedding.model = "hash-32".into();
    config.embedding.dimension = 32;
    config.background.decay_interval_secs = 3600;
    config.background.access_flush_ms = 25;
    config
}

/// A fully warmed engine backed by a temp directory.
pub async fn test_engine() -> (Arc<Engine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir));
    engine.mark_transport_ready();
    engine.warm().await.unwrap();
    (engine, dir)
}

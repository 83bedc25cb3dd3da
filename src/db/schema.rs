//! SQL DDL for all engine tables.
//!
//! Defines the `memories`, `memories_fts` (FTS5), `collections`, `memory_log`,
//! and `schema_meta` tables. Vector collections are vec0 virtual tables created
//! at runtime by [`crate::db::collections`]. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the engine's core tables.
const SCHEMA_SQL: &str = r#"
-- Core memory storage
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL CHECK(type IN ('fact','entity','conversation','reflection','code')),
    content TEXT NOT NULL,
    projection TEXT NOT NULL,
    importance REAL NOT NULL CHECK(importance >= 0.0 AND importance <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    tier TEXT NOT NULL DEFAULT 'short_term' CHECK(tier IN ('short_term','long_term','archived')),
    embedding_ref TEXT,
    embedding_model TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    source TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories(tier);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
CREATE INDEX IF NOT EXISTS idx_memories_last_accessed ON memories(last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

-- Lexical index (BM25) over the textual projection.
-- Holds every non-archived memory with a non-empty projection.
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    projection,
    id UNINDEXED,
    type UNINDEXED,
    content='memories',
    content_rowid='rowid'
);

-- Registry of vector collections (one vec0 virtual table each)
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    dimension INTEGER NOT NULL CHECK(dimension > 0),
    created_at TEXT NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','merge','access','decay','tier_move','delete','expire')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"memories".to_string()));
        assert!(tables.contains(&"collections".to_string()));
        assert!(tables.contains(&"memory_log".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));

        // sqlite-vec extension is loaded
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }
}

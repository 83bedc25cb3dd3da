pub mod collections;
pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the engine database at the given path, with all extensions
/// loaded, schema initialized, and the primary vector collection registered.
pub fn open_database(
    path: impl AsRef<Path>,
    primary_collection: &str,
    model: &str,
    dimension: usize,
) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).with_context(|| {
        format!("failed to open database at {}", path.display())
    })?;

    // WAL for concurrent readers; wait for locks instead of failing immediately
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    // Seed the primary collection only on a fresh database; after a completed
    // migration the active pointer names a differently-named collection and
    // the configured one must not be resurrected.
    if migrations::get_active_collection(&conn)
        .context("failed to read active collection")?
        .is_none()
    {
        if !collections::exists(&conn, primary_collection)
            .context("failed to check primary collection")?
        {
            collections::create(&conn, primary_collection, model, dimension)
                .context("failed to create primary collection")?;
        }
        migrations::set_active_collection(&conn, primary_collection)?;
    }

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Result of a full database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub active_collection: Option<String>,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: String,
    pub memory_count: i64,
    pub log_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;

    let active_collection = migrations::get_active_collection(conn)
        .context("failed to read active collection")?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;
    let integrity_ok = integrity_details == "ok";

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("failed to get sqlite-vec version")?;

    let memory_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap_or(0);

    let log_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memory_log", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        active_collection,
        integrity_ok,
        integrity_details,
        sqlite_vec_version,
        memory_count,
        log_count,
    })
}

/// Open an in-memory database for testing, with a 4-dimension primary collection.
#[cfg(test)]
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    collections::create(&conn, "primary", "hash-4", 4)?;
    migrations::set_active_collection(&conn, "primary")?;
    Ok(conn)
}

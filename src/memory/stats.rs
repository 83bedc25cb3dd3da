use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::db::collections;
use crate::error::{EngramError, Result};
use crate::memory::types::{MemoryType, Tier};

/// Response from memory_stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_tier: HashMap<String, u64>,
    pub index: IndexStats,
}

#[derive(Debug, Serialize)]
pub struct IndexStats {
    /// Vector count per collection.
    pub vectors: HashMap<String, u64>,
    /// Rows in the lexical index.
    pub lexical_entries: u64,
    pub db_size_bytes: u64,
}

/// Compute memory store statistics: counts by type and tier plus index sizes.
pub fn memory_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StatsResponse> {
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .map_err(EngramError::from)?;

    let by_type = count_grouped(conn, "type", MemoryType::all().iter().map(|t| t.as_str()))?;
    let by_tier = count_grouped(
        conn,
        "tier",
        [Tier::ShortTerm, Tier::LongTerm, Tier::Archived]
            .iter()
            .map(|t| t.as_str()),
    )?;

    let mut vectors = HashMap::new();
    for collection in collections::list(conn)? {
        let count = collections::vector_count(conn, &collection.name)?;
        vectors.insert(collection.name, count);
    }

    let lexical_entries: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories_fts", [], |row| row.get(0))
        .unwrap_or(0);

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total: total as u64,
        by_type,
        by_tier,
        index: IndexStats {
            vectors,
            lexical_entries: lexical_entries as u64,
            db_size_bytes,
        },
    })
}

fn count_grouped<'a>(
    conn: &Connection,
    column: &str,
    keys: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, u64>> {
    let mut map: HashMap<String, u64> = keys.map(|k| (k.to_string(), 0)).collect();

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {column}, COUNT(*) FROM memories GROUP BY {column}"
        ))
        .map_err(EngramError::from)?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(EngramError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)?;

    for (key, count) in rows {
        map.insert(key, count as u64);
    }
    Ok(map)
}

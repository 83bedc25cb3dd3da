//! Vector collection management over sqlite-vec.
//!
//! A collection is one vec0 virtual table (`vec_<name>`) plus a row in the
//! `collections` registry recording its embedding model and dimension. The
//! migration controller creates and drops collections at runtime, so table
//! names are built dynamically from validated collection names.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngramError, Result};

/// Registry entry for one vector collection.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub model: String,
    pub dimension: usize,
}

/// Collection names become SQL identifiers, so the charset is restricted.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(EngramError::invalid_arguments(format!(
            "invalid collection name: {name}"
        )))
    }
}

fn vec_table(name: &str) -> String {
    format!("vec_{name}")
}

/// Create a collection: register it and create its vec0 table.
pub fn create(conn: &Connection, name: &str, model: &str, dimension: usize) -> Result<()> {
    validate_name(name)?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO collections (name, model, dimension, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, model, dimension as i64, now],
    )?;
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(id TEXT PRIMARY KEY, embedding FLOAT[{dimension}]);",
        vec_table(name)
    ))?;
    tracing::info!(collection = name, model, dimension, "collection created");
    Ok(())
}

/// Drop a collection: remove its vec0 table and registry row.
pub fn drop(conn: &Connection, name: &str) -> Result<()> {
    validate_name(name)?;
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", vec_table(name)))?;
    conn.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
    tracing::info!(collection = name, "collection dropped");
    Ok(())
}

pub fn exists(conn: &Connection, name: &str) -> Result<bool> {
    validate_name(name)?;
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn info(conn: &Connection, name: &str) -> Result<CollectionInfo> {
    validate_name(name)?;
    conn.query_row(
        "SELECT name, model, dimension FROM collections WHERE name = ?1",
        params![name],
        |row| {
            Ok(CollectionInfo {
                name: row.get(0)?,
                model: row.get(1)?,
                dimension: row.get::<_, i64>(2)? as usize,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngramError::not_found(format!("collection: {name}")))
}

pub fn list(conn: &Connection) -> Result<Vec<CollectionInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, model, dimension FROM collections ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CollectionInfo {
                name: row.get(0)?,
                model: row.get(1)?,
                dimension: row.get::<_, i64>(2)? as usize,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert or replace the vector stored for `id`.
///
/// Rejects vectors whose length differs from the collection's declared
/// dimension before touching the table.
pub fn upsert_vector(conn: &Connection, name: &str, id: &str, embedding: &[f32]) -> Result<()> {
    let meta = info(conn, name)?;
    if embedding.len() != meta.dimension {
        return Err(EngramError::DimensionMismatch {
            expected: meta.dimension,
            actual: embedding.len(),
        });
    }
    let table = vec_table(name);
    conn.execute(
        &format!("DELETE FROM {table} WHERE id = ?1"),
        params![id],
    )?;
    conn.execute(
        &format!("INSERT INTO {table} (id, embedding) VALUES (?1, ?2)"),
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

pub fn delete_vector(conn: &Connection, name: &str, id: &str) -> Result<()> {
    validate_name(name)?;
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", vec_table(name)),
        params![id],
    )?;
    Ok(())
}

pub fn has_vector(conn: &Connection, name: &str, id: &str) -> Result<bool> {
    validate_name(name)?;
    let found: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE id = ?1", vec_table(name)),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// KNN search. Returns `(id, cosine_similarity)` pairs, best first, with the
/// similarity clamped to `[0, 1]` for downstream fusion.
///
/// sqlite-vec returns L2 distance; for L2-normalized vectors
/// `cos = 1 - d^2 / 2`.
pub fn knn(
    conn: &Connection,
    name: &str,
    embedding: &[f32],
    k: usize,
) -> Result<Vec<(String, f64)>> {
    let meta = info(conn, name)?;
    if embedding.len() != meta.dimension {
        return Err(EngramError::DimensionMismatch {
            expected: meta.dimension,
            actual: embedding.len(),
        });
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id, distance FROM {} WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        vec_table(name)
    ))?;
    let rows = stmt
        .query_map(params![embedding_to_bytes(embedding), k as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(id, dist)| (id, (1.0 - dist * dist / 2.0).clamp(0.0, 1.0)))
        .collect())
}

/// Number of vectors currently stored in the collection.
pub fn vector_count(conn: &Connection, name: &str) -> Result<u64> {
    validate_name(name)?;
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", vec_table(name)),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// For L2-normalized vectors: `L2_dist = sqrt(2 * (1 - cosine_similarity))`.
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

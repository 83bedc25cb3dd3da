//! Write path — deduplication, storage, index sync, and audit logging.
//!
//! [`store_memory`] runs the full pipeline inside a transaction: dedup check
//! via vector similarity (facts and entities only), vector insert, memories
//! row insert, FTS5 sync, and an audit log entry. The transaction makes the
//! vector/record/lexical writes atomic with respect to concurrent readers.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::db::collections;
use crate::error::{EngramError, Result};
use crate::memory::types::{clamp_importance, Memory, MemoryContent, Tier};
use crate::memory::CollectionWrite;

/// Result returned from a store operation.
#[derive(Debug, Serialize)]
pub struct StoreOutcome {
    /// Id of the stored memory — or of the existing record this one merged into.
    pub id: String,
    /// `true` if the record was merged into an existing near-duplicate.
    pub merged: bool,
}

/// Full write path: dedup gate → vec insert → row insert → FTS sync → audit log.
///
/// `writes` carries one embedding per destination collection; the first entry
/// is the active collection and decides `embedding_ref`/`embedding_model`.
#[allow(clippy::too_many_arguments)]
pub fn store_memory(
    conn: &mut Connection,
    content: &MemoryContent,
    importance: f64,
    tags: &BTreeSet<String>,
    source: Option<&str>,
    writes: &[CollectionWrite],
    dedup_threshold: f64,
) -> Result<StoreOutcome> {
    let primary = writes
        .first()
        .ok_or_else(|| EngramError::internal("store_memory requires at least one embedding"))?;

    let tx = conn.transaction().map_err(EngramError::from)?;

    // 1. Dedup gate (facts and entities only)
    if content.memory_type().deduplicates() {
        if let Some(existing_id) = find_duplicate(
            &tx,
            &primary.collection,
            content,
            &primary.embedding,
            dedup_threshold,
        )? {
            merge_into_existing(&tx, &existing_id, importance, tags, source)?;
            write_audit_log(
                &tx,
                "merge",
                &existing_id,
                Some(&serde_json::json!({"reason": "dedup", "type": content.memory_type().as_str()})),
            )?;
            tx.commit().map_err(EngramError::from)?;
            return Ok(StoreOutcome {
                id: existing_id,
                merged: true,
            });
        }
    }

    // 2. New record
    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let projection = content.projection();

    // 3. Vector writes first, so a reader that sees the row also finds its vector
    for write in writes {
        collections::upsert_vector(&tx, &write.collection, &id, &write.embedding)?;
    }

    // 4. Memories row
    let content_json = serde_json::to_string(&content.to_json()?)?;
    let tags_json = serde_json::to_string(tags)?;
    tx.execute(
        "INSERT INTO memories (id, type, content, projection, importance, access_count, \
         created_at, updated_at, tier, embedding_ref, embedding_model, tags, source) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            content.memory_type().as_str(),
            content_json,
            projection,
            clamp_importance(importance),
            now,
            Tier::ShortTerm.as_str(),
            primary.collection,
            primary.model,
            tags_json,
            source,
        ],
    )
    .map_err(EngramError::from)?;
    let rowid = tx.last_insert_rowid();

    // 5. FTS5 sync (non-archived with non-empty projection; new rows are short_term)
    if !projection.is_empty() {
        insert_fts(&tx, rowid, &projection, &id, content.memory_type().as_str())?;
    }

    // 6. Audit log
    write_audit_log(&tx, "create", &id, None)?;

    tx.commit().map_err(EngramError::from)?;

    Ok(StoreOutcome { id, merged: false })
}

/// Fetch a single memory by id. Reflection refs are pruned of tombstones
/// before the record is returned.
pub fn get_memory(conn: &Connection, id: &str) -> Result<Memory> {
    let mut memory = conn
        .query_row(
            &format!("SELECT {} FROM memories WHERE id = ?1", Memory::COLUMNS),
            params![id],
            Memory::from_row,
        )
        .optional()
        .map_err(EngramError::from)?
        .ok_or_else(|| EngramError::not_found(format!("memory: {id}")))?;
    crate::memory::prune_reflection_refs(conn, &mut memory)?;
    Ok(memory)
}

/// KNN against the active collection looking for a same-type near-duplicate.
///
/// Results come back ordered best-first, so the scan stops at the first
/// candidate below the threshold.
fn find_duplicate(
    tx: &Transaction<'_>,
    collection: &str,
    content: &MemoryContent,
    embedding: &[f32],
    threshold: f64,
) -> Result<Option<String>> {
    let candidates = collections::knn(tx, collection, embedding, 20)?;
    for (candidate_id, similarity) in candidates {
        if similarity < threshold {
            break;
        }
        let candidate_type: Option<String> = tx
            .query_row(
                "SELECT type FROM memories WHERE id = ?1",
                params![candidate_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngramError::from)?;
        if candidate_type.as_deref() == Some(content.memory_type().as_str()) {
            return Ok(Some(candidate_id));
        }
    }
    Ok(None)
}

/// Merge an incoming near-duplicate into the existing record: tags and source
/// are unioned, importance takes the max of the two.
fn merge_into_existing(
    tx: &Transaction<'_>,
    existing_id: &str,
    incoming_importance: f64,
    incoming_tags: &BTreeSet<String>,
    incoming_source: Option<&str>,
) -> Result<()> {
    let (importance, tags_json, source): (f64, String, Option<String>) = tx
        .query_row(
            "SELECT importance, tags, source FROM memories WHERE id = ?1",
            params![existing_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(EngramError::from)?;

    let mut tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    tags.extend(incoming_tags.iter().cloned());

    let merged_source = match (source, incoming_source) {
        (Some(existing), Some(incoming)) if !existing.split("; ").any(|s| s == incoming) => {
            Some(format!("{existing}; {incoming}"))
        }
        (Some(existing), _) => Some(existing),
        (None, incoming) => incoming.map(str::to_string),
    };

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE memories SET importance = ?1, tags = ?2, source = ?3, updated_at = ?4 WHERE id = ?5",
        params![
            clamp_importance(importance.max(incoming_importance)),
            serde_json::to_string(&tags)?,
            merged_source,
            now,
            existing_id,
        ],
    )
    .map_err(EngramError::from)?;
    Ok(())
}

/// Sync the FTS5 index after inserting into the memories table.
///
/// Must use the same rowid as the corresponding `memories` row.
pub(crate) fn insert_fts(
    conn: &Connection,
    rowid: i64,
    projection: &str,
    id: &str,
    memory_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memories_fts (rowid, projection, id, type) VALUES (?1, ?2, ?3, ?4)",
        params![rowid, projection, id, memory_type],
    )
    .map_err(EngramError::from)?;
    Ok(())
}

/// Remove a row from the FTS5 index (external content tables need the
/// special 'delete' insert with the original column values).
pub(crate) fn delete_fts(
    conn: &Connection,
    rowid: i64,
    projection: &str,
    id: &str,
    memory_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memories_fts(memories_fts, rowid, projection, id, type) \
         VALUES('delete', ?1, ?2, ?3, ?4)",
        params![rowid, projection, id, memory_type],
    )
    .map_err(EngramError::from)?;
    Ok(())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )
    .map_err(EngramError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::types::MemoryType;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn fact(statement: &str) -> MemoryContent {
        MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({ "statement": statement }),
        )
        .unwrap()
    }

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        v[axis] = 1.0;
        v
    }

    fn near_unit0() -> Vec<f32> {
        // cosine sim vs unit(0) ~ 0.997
        let v = vec![0.99f32, 0.07, 0.0, 0.0];
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn writes(embedding: Vec<f32>) -> Vec<CollectionWrite> {
        vec![CollectionWrite {
            collection: "primary".into(),
            model: "hash-4".into(),
            embedding,
        }]
    }

    #[test]
    fn store_new_memory_populates_all_indexes() {
        let mut conn = test_db();
        let outcome = store_memory(
            &mut conn,
            &fact("Rust is a systems language"),
            0.8,
            &BTreeSet::new(),
            Some("unit-test"),
            &writes(unit(0)),
            0.92,
        )
        .unwrap();
        assert!(!outcome.merged);

        let memory = get_memory(&conn, &outcome.id).unwrap();
        assert_eq!(memory.memory_type, MemoryType::Fact);
        assert_eq!(memory.tier, Tier::ShortTerm);
        assert_eq!(memory.embedding_ref.as_deref(), Some("primary"));
        assert_eq!(memory.embedding_model, "hash-4");
        assert_eq!(memory.source.as_deref(), Some("unit-test"));

        // Vector present
        assert!(collections::has_vector(&conn, "primary", &outcome.id).unwrap());

        // Lexical entry present
        let fts_id: String = conn
            .query_row(
                "SELECT id FROM memories_fts WHERE memories_fts MATCH 'rust'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, outcome.id);
    }

    #[test]
    fn dedup_merges_same_type_high_similarity() {
        let mut conn = test_db();
        let first = store_memory(
            &mut conn,
            &fact("Paris is the capital of France"),
            0.8,
            &BTreeSet::new(),
            Some("chat"),
            &writes(unit(0)),
            0.92,
        )
        .unwrap();

        let tags: BTreeSet<String> = ["geo".to_string()].into();
        let second = store_memory(
            &mut conn,
            &fact("Paris is France's capital"),
            0.5,
            &tags,
            Some("import"),
            &writes(near_unit0()),
            0.92,
        )
        .unwrap();

        assert!(second.merged);
        assert_eq!(second.id, first.id);

        let memory = get_memory(&conn, &first.id).unwrap();
        // Tags unioned, importance is max of the two, sources joined
        assert!(memory.tags.contains("geo"));
        assert!((memory.importance - 0.8).abs() < 1e-9);
        assert_eq!(memory.source.as_deref(), Some("chat; import"));

        // Only one vector exists
        assert_eq!(collections::vector_count(&conn, "primary").unwrap(), 1);
    }

    #[test]
    fn dedup_skips_different_type() {
        let mut conn = test_db();
        let first = store_memory(
            &mut conn,
            &fact("Rust is great"),
            0.5,
            &BTreeSet::new(),
            None,
            &writes(unit(0)),
            0.92,
        )
        .unwrap();

        let entity = MemoryContent::parse(
            MemoryType::Entity,
            serde_json::json!({"name": "Rust", "attributes": {}}),
        )
        .unwrap();
        let second = store_memory(
            &mut conn,
            &entity,
            0.5,
            &BTreeSet::new(),
            None,
            &writes(unit(0)),
            0.92,
        )
        .unwrap();

        assert!(!second.merged);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn conversations_never_dedup() {
        let mut conn = test_db();
        let convo = MemoryContent::parse(
            MemoryType::Conversation,
            serde_json::json!({"messages": [{"role": "user", "text": "hello"}]}),
        )
        .unwrap();

        let first = store_memory(
            &mut conn, &convo, 0.5, &BTreeSet::new(), None, &writes(unit(0)), 0.92,
        )
        .unwrap();
        let second = store_memory(
            &mut conn, &convo, 0.5, &BTreeSet::new(), None, &writes(unit(0)), 0.92,
        )
        .unwrap();

        assert!(!second.merged);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn low_similarity_does_not_merge() {
        let mut conn = test_db();
        let first = store_memory(
            &mut conn,
            &fact("Rust is great"),
            0.5,
            &BTreeSet::new(),
            None,
            &writes(unit(0)),
            0.92,
        )
        .unwrap();
        let second = store_memory(
            &mut conn,
            &fact("Python is fun"),
            0.5,
            &BTreeSet::new(),
            None,
            &writes(unit(1)),
            0.92,
        )
        .unwrap();
        assert!(!second.merged);
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn dual_write_stores_vector_in_both_collections() {
        let mut conn = test_db();
        collections::create(&conn, "secondary", "hash-8", 8).unwrap();

        let dual = vec![
            CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(0),
            },
            CollectionWrite {
                collection: "secondary".into(),
                model: "hash-8".into(),
                embedding: vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            },
        ];
        let outcome = store_memory(
            &mut conn,
            &fact("dual written"),
            0.5,
            &BTreeSet::new(),
            None,
            &dual,
            0.92,
        )
        .unwrap();

        assert!(collections::has_vector(&conn, "primary", &outcome.id).unwrap());
        assert!(collections::has_vector(&conn, "secondary", &outcome.id).unwrap());

        let memory = get_memory(&conn, &outcome.id).unwrap();
        assert_eq!(memory.embedding_ref.as_deref(), Some("primary"));
    }

    #[test]
    fn audit_log_written_on_create() {
        let mut conn = test_db();
        let outcome = store_memory(
            &mut conn,
            &fact("logged"),
            0.5,
            &BTreeSet::new(),
            None,
            &writes(unit(0)),
            0.92,
        )
        .unwrap();

        let op: String = conn
            .query_row(
                "SELECT operation FROM memory_log WHERE memory_id = ?1",
                params![outcome.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(op, "create");
    }

    #[test]
    fn importance_clamped_on_store() {
        let mut conn = test_db();
        let outcome = store_memory(
            &mut conn,
            &fact("clamped"),
            7.5,
            &BTreeSet::new(),
            None,
            &writes(unit(0)),
            0.92,
        )
        .unwrap();
        let memory = get_memory(&conn, &outcome.id).unwrap();
        assert_eq!(memory.importance, 1.0);
    }

    #[test]
    fn get_missing_memory_is_not_found() {
        let conn = test_db();
        let err = get_memory(&conn, "nope").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut conn = test_db();
        let err = store_memory(
            &mut conn,
            &fact("wrong dims"),
            0.5,
            &BTreeSet::new(),
            None,
            &writes(vec![1.0, 0.0]),
            0.92,
        )
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DimensionMismatch);
    }
}

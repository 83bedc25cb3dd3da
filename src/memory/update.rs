//! Patch path for existing memories.
//!
//! Content changes re-project and re-embed; a content patch that would merge
//! into a *different* existing record via the dedup gate is rejected with
//! `CONFLICT` rather than silently collapsing two ids.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::collections;
use crate::error::{EngramError, Result};
use crate::memory::store::{delete_fts, get_memory, insert_fts, write_audit_log};
use crate::memory::types::{clamp_importance, Memory, MemoryContent, Tier};
use crate::memory::CollectionWrite;

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct MemoryPatch {
    /// Replacement content; must match the record's existing type.
    pub content: Option<MemoryContent>,
    pub importance: Option<f64>,
    /// Replacement tag set.
    pub tags: Option<BTreeSet<String>>,
    pub source: Option<String>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance.is_none()
            && self.tags.is_none()
            && self.source.is_none()
    }
}

/// Apply a patch. `writes` carries the re-computed embeddings when the patch
/// replaces content (one per destination collection, active first); it must
/// be `None` otherwise.
pub fn update_memory(
    conn: &mut Connection,
    id: &str,
    patch: &MemoryPatch,
    writes: Option<&[CollectionWrite]>,
    dedup_threshold: f64,
) -> Result<Memory> {
    if patch.is_empty() {
        return Err(EngramError::invalid_arguments("empty patch"));
    }

    let tx = conn.transaction().map_err(EngramError::from)?;

    let existing = tx
        .query_row(
            &format!("SELECT {} FROM memories WHERE id = ?1", Memory::COLUMNS),
            params![id],
            Memory::from_row,
        )
        .optional()
        .map_err(EngramError::from)?
        .ok_or_else(|| EngramError::not_found(format!("memory: {id}")))?;

    let now = chrono::Utc::now().to_rfc3339();

    if let Some(content) = &patch.content {
        if content.memory_type() != existing.memory_type {
            return Err(EngramError::invalid_arguments(format!(
                "content shape is {}, record is {}",
                content.memory_type(),
                existing.memory_type
            )));
        }
        let writes = writes.ok_or_else(|| {
            EngramError::internal("content patch requires re-computed embeddings")
        })?;
        let primary = writes
            .first()
            .ok_or_else(|| EngramError::internal("content patch requires embeddings"))?;

        // A content change that now duplicates another record is a conflict
        if content.memory_type().deduplicates() {
            let candidates =
                collections::knn(&tx, &primary.collection, &primary.embedding, 20)?;
            for (candidate_id, similarity) in candidates {
                if similarity < dedup_threshold {
                    break;
                }
                if candidate_id != id {
                    let same_type: Option<String> = tx
                        .query_row(
                            "SELECT id FROM memories WHERE id = ?1 AND type = ?2",
                            params![candidate_id, existing.memory_type.as_str()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(EngramError::from)?;
                    if same_type.is_some() {
                        return Err(EngramError::conflict(format!(
                            "patched content duplicates memory {candidate_id}"
                        )));
                    }
                }
            }
        }

        let projection = content.projection();

        // Vectors first, then the row, then the lexical index
        for write in writes {
            collections::upsert_vector(&tx, &write.collection, id, &write.embedding)?;
        }

        let rowid: i64 = tx
            .query_row(
                "SELECT rowid FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(EngramError::from)?;
        let old_projection: String = tx
            .query_row(
                "SELECT projection FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(EngramError::from)?;

        tx.execute(
            "UPDATE memories SET content = ?1, projection = ?2, embedding_ref = ?3, \
             embedding_model = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                serde_json::to_string(&content.to_json()?)?,
                projection,
                primary.collection,
                primary.model,
                now,
                id,
            ],
        )
        .map_err(EngramError::from)?;

        // Lexical index only carries non-archived memories
        if existing.tier != Tier::Archived {
            if !old_projection.is_empty() {
                delete_fts(&tx, rowid, &old_projection, id, existing.memory_type.as_str())?;
            }
            if !projection.is_empty() {
                insert_fts(&tx, rowid, &projection, id, existing.memory_type.as_str())?;
            }
        }
    }

    if let Some(importance) = patch.importance {
        tx.execute(
            "UPDATE memories SET importance = ?1, updated_at = ?2 WHERE id = ?3",
            params![clamp_importance(importance), now, id],
        )
        .map_err(EngramError::from)?;
    }
    if let Some(tags) = &patch.tags {
        tx.execute(
            "UPDATE memories SET tags = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(tags)?, now, id],
        )
        .map_err(EngramError::from)?;
    }
    if let Some(source) = &patch.source {
        tx.execute(
            "UPDATE memories SET source = ?1, updated_at = ?2 WHERE id = ?3",
            params![source, now, id],
        )
        .map_err(EngramError::from)?;
    }

    write_audit_log(
        &tx,
        "update",
        id,
        Some(&serde_json::json!({
            "content": patch.content.is_some(),
            "importance": patch.importance,
        })),
    )?;

    tx.commit().map_err(EngramError::from)?;
    get_memory(conn, id)
}

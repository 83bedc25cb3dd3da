//! Memory deletion and retention expiry.
//!
//! Delete removes the memories row before sweeping the index entries, so a
//! concurrent lexical or vector hit can never hydrate a deleted record. The
//! whole sweep runs in one transaction. Delete is idempotent at the tool
//! level: deleting an absent id reports `deleted: false`.

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::collections;
use crate::error::{EngramError, Result};
use crate::memory::store::{delete_fts, write_audit_log};
use crate::memory::types::Tier;

/// Delete a memory and sweep its index entries from every collection.
///
/// Returns `true` if the memory existed, `false` otherwise.
pub fn delete_memory(conn: &mut Connection, id: &str) -> Result<bool> {
    let tx = conn.transaction().map_err(EngramError::from)?;

    let row: Option<(i64, String, String, String)> = tx
        .query_row(
            "SELECT rowid, projection, type, tier FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(EngramError::from)?;

    let Some((rowid, projection, memory_type, tier)) = row else {
        return Ok(false);
    };

    // Audit first (the log references the id as text, not a foreign key)
    write_audit_log(&tx, "delete", id, None)?;

    // 1. Record row goes first
    tx.execute("DELETE FROM memories WHERE id = ?1", params![id])
        .map_err(EngramError::from)?;

    // 2. Lexical sweep (archived memories have no FTS entry)
    if tier != Tier::Archived.as_str() && !projection.is_empty() {
        delete_fts(&tx, rowid, &projection, id, &memory_type)?;
    }

    // 3. Vector sweep across every registered collection (dual-writes may
    // have left a vector in a migration secondary)
    for collection in collections::list(&tx)? {
        collections::delete_vector(&tx, &collection.name, id)?;
    }

    tx.commit().map_err(EngramError::from)?;
    Ok(true)
}

/// Retention expiry for the archived tier: hard-delete archived memories
/// older than the retention window. Each expiry is logged with the final
/// importance, so no memory is ever silently lost.
pub fn expire_archived(
    conn: &mut Connection,
    retention_days: u64,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days as i64)).to_rfc3339();

    let expired: Vec<(String, f64)> = {
        let mut stmt = conn
            .prepare(
                "SELECT id, importance FROM memories \
                 WHERE tier = 'archived' AND updated_at < ?1",
            )
            .map_err(EngramError::from)?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(EngramError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngramError::from)?;
        rows
    };

    let mut count = 0;
    for (id, importance) in expired {
        write_audit_log(
            conn,
            "expire",
            &id,
            Some(&serde_json::json!({"final_importance": importance})),
        )?;
        tracing::info!(id = %id, importance, "archived memory expired by retention policy");
        if delete_memory(conn, &id)? {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::store_memory;
    use crate::memory::types::{MemoryContent, MemoryType};
    use crate::memory::CollectionWrite;
    use std::collections::BTreeSet;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        v[axis] = 1.0;
        v
    }

    fn insert(conn: &mut Connection, statement: &str) -> String {
        let content = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({ "statement": statement }),
        )
        .unwrap();
        store_memory(
            conn,
            &content,
            0.5,
            &BTreeSet::new(),
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(0),
            }],
            0.92,
        )
        .unwrap()
        .id
    }

    #[test]
    fn delete_sweeps_all_indexes() {
        let mut conn = test_db();
        let id = insert(&mut conn, "short lived memory");

        assert!(delete_memory(&mut conn, &id).unwrap());

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(remaining, 0);

        assert!(!collections::has_vector(&conn, "primary", &id).unwrap());

        let fts_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'lived'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts_hits, 0);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut conn = test_db();
        let id = insert(&mut conn, "delete me twice");

        assert!(delete_memory(&mut conn, &id).unwrap());
        assert!(!delete_memory(&mut conn, &id).unwrap());
    }

    #[test]
    fn delete_sweeps_secondary_collection_vectors() {
        let mut conn = test_db();
        collections::create(&conn, "secondary", "hash-4", 4).unwrap();
        let id = insert(&mut conn, "dual written memory");
        collections::upsert_vector(&conn, "secondary", &id, &unit(0)).unwrap();

        assert!(delete_memory(&mut conn, &id).unwrap());
        assert!(!collections::has_vector(&conn, "secondary", &id).unwrap());
    }

    #[test]
    fn expire_archived_removes_and_logs() {
        let mut conn = test_db();
        let id = insert(&mut conn, "ancient archived memory");
        // Force it into archived long ago
        conn.execute(
            "UPDATE memories SET tier = 'archived', updated_at = '2020-01-01T00:00:00Z' WHERE id = ?1",
            params![id],
        )
        .unwrap();
        // Archived memories carry no FTS entry
        conn.execute(
            "INSERT INTO memories_fts(memories_fts, rowid, projection, id, type) \
             SELECT 'delete', rowid, projection, id, type FROM memories WHERE id = ?1",
            params![id],
        )
        .unwrap();

        let count = expire_archived(&mut conn, 365, chrono::Utc::now()).unwrap();
        assert_eq!(count, 1);

        let log_op: String = conn
            .query_row(
                "SELECT operation FROM memory_log WHERE memory_id = ?1 AND operation = 'expire'",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(log_op, "expire");
    }

    #[test]
    fn fresh_archived_memory_not_expired() {
        let mut conn = test_db();
        let id = insert(&mut conn, "recently archived");
        conn.execute(
            "UPDATE memories SET tier = 'archived' WHERE id = ?1",
            params![id],
        )
        .unwrap();

        let count = expire_archived(&mut conn, 365, chrono::Utc::now()).unwrap();
        assert_eq!(count, 0);
    }
}

//! Core memory engine — write path, hybrid retrieval, tier lifecycle,
//! episodic buffering, and access tracking.
//!
//! The write path lives in [`store`] and [`update`], the read path in
//! [`search`], deletion in [`forget`], the temporal lifecycle in [`tiers`],
//! the conversation buffer in [`episodic`], batched access side-effects in
//! [`access`], and statistics in [`stats`]. Type definitions live in
//! [`types`].

pub mod access;
pub mod episodic;
pub mod forget;
pub mod search;
pub mod stats;
pub mod store;
pub mod tiers;
pub mod types;
pub mod update;

/// One embedding destined for a named collection, tagged with the model that
/// produced it. The write paths accept a slice of these so the migration
/// controller can dual-write without the store layer knowing about migration.
#[derive(Debug, Clone)]
pub struct CollectionWrite {
    pub collection: String,
    pub model: String,
    pub embedding: Vec<f32>,
}

/// Drop tombstone ids from a reflection's `refs` list.
///
/// Reflection refs are weak back-references: deleting a referent leaves its
/// id behind as a tombstone, which every read path filters out here before
/// the record reaches a caller. Non-reflection memories pass through
/// untouched.
pub fn prune_reflection_refs(
    conn: &rusqlite::Connection,
    memory: &mut types::Memory,
) -> crate::error::Result<()> {
    if memory.memory_type != types::MemoryType::Reflection {
        return Ok(());
    }
    let Some(refs) = memory.content.get("refs").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    if refs.is_empty() {
        return Ok(());
    }

    let mut stmt = conn
        .prepare_cached("SELECT COUNT(*) FROM memories WHERE id = ?1")
        .map_err(crate::error::EngramError::from)?;
    let mut live = Vec::with_capacity(refs.len());
    for r in refs {
        let Some(id) = r.as_str() else {
            continue;
        };
        let exists: i64 = stmt
            .query_row(rusqlite::params![id], |row| row.get(0))
            .map_err(crate::error::EngramError::from)?;
        if exists > 0 {
            live.push(serde_json::Value::String(id.to_string()));
        }
    }

    if live.len() != refs.len() {
        if let Some(obj) = memory.content.as_object_mut() {
            obj.insert("refs".into(), serde_json::Value::Array(live));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::store_memory;
    use crate::memory::types::{MemoryContent, MemoryType};
    use std::collections::BTreeSet;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 4];
        v[axis % 4] = 1.0;
        v
    }

    fn insert(conn: &mut rusqlite::Connection, content: MemoryContent, axis: usize) -> String {
        store_memory(
            conn,
            &content,
            0.5,
            &BTreeSet::new(),
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(axis),
            }],
            0.999,
        )
        .unwrap()
        .id
    }

    #[test]
    fn prune_drops_only_dead_refs() {
        let mut conn = db::open_memory_database().unwrap();
        let fact = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "referenced fact"}),
        )
        .unwrap();
        let live_id = insert(&mut conn, fact, 0);

        let reflection = MemoryContent::parse(
            MemoryType::Reflection,
            serde_json::json!({"body": "summary", "refs": [live_id.clone(), "gone-id"]}),
        )
        .unwrap();
        let reflection_id = insert(&mut conn, reflection, 1);

        let mut memory = store::get_memory(&conn, &reflection_id).unwrap();
        let refs = memory.content["refs"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].as_str().unwrap(), live_id);

        // Idempotent on an already-pruned record
        prune_reflection_refs(&conn, &mut memory).unwrap();
        assert_eq!(memory.content["refs"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn prune_leaves_non_reflections_alone() {
        let mut conn = db::open_memory_database().unwrap();
        let fact = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "plain fact"}),
        )
        .unwrap();
        let id = insert(&mut conn, fact, 0);

        let mut memory = store::get_memory(&conn, &id).unwrap();
        let before = memory.content.clone();
        prune_reflection_refs(&conn, &mut memory).unwrap();
        assert_eq!(memory.content, before);
    }

    #[test]
    fn prune_handles_missing_refs_field() {
        let mut conn = db::open_memory_database().unwrap();
        let reflection = MemoryContent::parse(
            MemoryType::Reflection,
            serde_json::json!({"body": "no refs at all"}),
        )
        .unwrap();
        let id = insert(&mut conn, reflection, 0);

        let mut memory = store::get_memory(&conn, &id).unwrap();
        prune_reflection_refs(&conn, &mut memory).unwrap();
        assert!(memory.content.get("refs").is_none());
    }
}

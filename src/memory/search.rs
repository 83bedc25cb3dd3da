//! Read path — hybrid retrieval and listing.
//!
//! [`retrieve`] fuses vector KNN and FTS5 BM25 candidates with Reciprocal
//! Rank Fusion, thresholds on the normalized fused score, then re-weights by
//! recency and importance. Access side-effects are NOT applied here; the
//! caller forwards returned ids to the access batcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::collections;
use crate::error::{EngramError, Result};
use crate::memory::types::{Memory, MemoryType, Tier};

/// Filters applied to retrieval candidates after fusion.
#[derive(Debug, Default, Clone)]
pub struct RetrievalFilter {
    pub types: Option<Vec<MemoryType>>,
    pub tiers: Option<Vec<Tier>>,
    /// Any-match over the memory's tag set.
    pub tags: Option<Vec<String>>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
}

/// Retrieval pipeline knobs. Mirrors the `[retrieval]` config section.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub k: usize,
    pub candidate_multiplier: usize,
    pub rrf_k: usize,
    pub semantic_threshold: f64,
    pub semantic_weight: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    pub hybrid: bool,
}

impl RetrievalParams {
    pub fn from_config(retrieval: &crate::config::RetrievalConfig, k: usize) -> Self {
        Self {
            k,
            candidate_multiplier: retrieval.candidate_multiplier,
            rrf_k: retrieval.rrf_k,
            semantic_threshold: retrieval.semantic_threshold,
            semantic_weight: retrieval.semantic_weight,
            recency_weight: retrieval.recency_weight,
            importance_weight: retrieval.importance_weight,
            hybrid: retrieval.hybrid,
        }
    }
}

/// One ranked retrieval result.
#[derive(Debug, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    /// Final score after recency/importance re-weighting.
    pub score: f64,
    /// Normalized fused score, before re-weighting.
    pub fused: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
}

/// Hybrid retrieval against one collection.
///
/// `semantic_threshold` applies to the min-max-normalized fused score only,
/// before the recency/importance re-weighting.
pub fn retrieve(
    conn: &Connection,
    collection: &str,
    query_embedding: &[f32],
    query_text: &str,
    filter: &RetrievalFilter,
    params: &RetrievalParams,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredMemory>> {
    let candidate_limit = params.k.max(1) * params.candidate_multiplier.max(1);

    // 1. Both candidate legs
    let vector_hits = collections::knn(conn, collection, query_embedding, candidate_limit)?;
    let lexical_hits = if params.hybrid {
        lexical_search(conn, query_text, candidate_limit)?
    } else {
        Vec::new()
    };

    // 2. Per-source normalization (kept for the result payload; RRF itself
    // only consumes ranks)
    let vector_norm = min_max_normalize(&vector_hits);
    let lexical_norm = min_max_normalize(&lexical_hits);

    // 3. Reciprocal Rank Fusion
    let fused = rrf_merge(&vector_hits, &lexical_hits, params.rrf_k);
    if fused.is_empty() {
        return Ok(Vec::new());
    }

    // 4. Hydrate and post-filter
    let ids: Vec<&str> = fused.iter().map(|(id, _)| id.as_str()).collect();
    let memories = fetch_memories(conn, &ids)?;

    let mut surviving: Vec<(Memory, f64)> = Vec::new();
    for (id, fused_score) in &fused {
        let Some(memory) = memories.get(id.as_str()) else {
            continue;
        };
        if !matches_filter(memory, filter) {
            continue;
        }
        surviving.push((memory.clone(), *fused_score));
    }

    // 5. Normalize fused scores over the surviving set, apply the threshold
    let fused_scores: Vec<(String, f64)> = surviving
        .iter()
        .map(|(m, s)| (m.id.clone(), *s))
        .collect();
    let fused_normalized = min_max_normalize(&fused_scores);

    // 6. Re-weight and rank
    let mut results: Vec<ScoredMemory> = surviving
        .into_iter()
        .filter_map(|(memory, _)| {
            let fused = *fused_normalized.get(&memory.id)?;
            if fused < params.semantic_threshold {
                return None;
            }
            let recency = recency_score(&memory.created_at, now);
            let score = params.semantic_weight * fused
                + params.recency_weight * recency
                + params.importance_weight * memory.importance;
            let vector_similarity = vector_norm.get(&memory.id).copied();
            let lexical_score = lexical_norm.get(&memory.id).copied();
            Some(ScoredMemory {
                memory,
                score,
                fused,
                vector_similarity,
                lexical_score,
            })
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(params.k);
    Ok(results)
}

/// `exp(-Δt_days / 30)`, with Δt measured from creation.
fn recency_score(created_at: &str, now: DateTime<Utc>) -> f64 {
    let Ok(created) = DateTime::parse_from_rfc3339(created_at) else {
        return 0.0;
    };
    let age_days = (now - created.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0;
    (-age_days / 30.0).exp()
}

/// FTS5 BM25 keyword search.
///
/// Returns (id, score) pairs with higher-is-better scores (FTS5 rank is
/// negative, more negative = better, so it is negated).
pub fn lexical_search(
    conn: &Connection,
    query_text: &str,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, rank FROM memories_fts WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![escaped, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, -row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)?;
    Ok(results)
}

/// Escape a user query for FTS5 MATCH syntax: each whitespace-delimited word
/// is wrapped in double quotes so FTS5 treats them as plain terms.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reciprocal Rank Fusion merge over ranked candidate lists.
///
/// Documents appearing in both lists get additive scores. Returns pairs
/// sorted best-first.
fn rrf_merge(
    vector_hits: &[(String, f64)],
    lexical_hits: &[(String, f64)],
    k: usize,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for (rank, (id, _)) in vector_hits.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64);
    }
    for (rank, (id, _)) in lexical_hits.iter().enumerate() {
        *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64);
    }

    let mut merged: Vec<(String, f64)> = scores.into_iter().collect();
    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Min-max normalize scores to [0, 1] over the returned set. A single
/// candidate (or a flat set) normalizes to 1.0.
fn min_max_normalize(hits: &[(String, f64)]) -> HashMap<String, f64> {
    if hits.is_empty() {
        return HashMap::new();
    }
    let min = hits.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    hits.iter()
        .map(|(id, s)| {
            let normalized = if range > f64::EPSILON {
                (s - min) / range
            } else {
                1.0
            };
            (id.clone(), normalized)
        })
        .collect()
}

fn matches_filter(memory: &Memory, filter: &RetrievalFilter) -> bool {
    if let Some(types) = &filter.types {
        if !types.contains(&memory.memory_type) {
            return false;
        }
    }
    if let Some(tiers) = &filter.tiers {
        if !tiers.contains(&memory.tier) {
            return false;
        }
    }
    if let Some(tags) = &filter.tags {
        if !tags.iter().any(|t| memory.tags.contains(t)) {
            return false;
        }
    }
    if let Some(after) = &filter.created_after {
        if memory.created_at.as_str() < after.as_str() {
            return false;
        }
    }
    if let Some(before) = &filter.created_before {
        if memory.created_at.as_str() > before.as_str() {
            return false;
        }
    }
    true
}

/// Batch-fetch memory records by id. Reflection refs are pruned of
/// tombstones before the records leave the read path.
fn fetch_memories(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, Memory>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {} FROM memories WHERE id IN ({})",
        Memory::COLUMNS,
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> = ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let mut rows = stmt
        .query_map(sql_params.as_slice(), Memory::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)?;

    for memory in &mut rows {
        crate::memory::prune_reflection_refs(conn, memory)?;
    }

    Ok(rows.into_iter().map(|m| (m.id.clone(), m)).collect())
}

/// Page of results from [`list_memories`].
#[derive(Debug, Serialize)]
pub struct ListPage {
    pub items: Vec<Memory>,
    pub total: u64,
}

/// List memories by type/tier/tag with offset pagination, newest first.
pub fn list_memories(
    conn: &Connection,
    types: Option<&[MemoryType]>,
    tier: Option<Tier>,
    tag: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<ListPage> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(types) = types {
        if !types.is_empty() {
            let placeholders: Vec<String> = types
                .iter()
                .map(|t| {
                    args.push(Box::new(t.as_str().to_string()));
                    format!("?{}", args.len())
                })
                .collect();
            clauses.push(format!("type IN ({})", placeholders.join(", ")));
        }
    }
    if let Some(tier) = tier {
        args.push(Box::new(tier.as_str().to_string()));
        clauses.push(format!("tier = ?{}", args.len()));
    }
    if let Some(tag) = tag {
        // Tags are stored as a JSON array of strings; exact-element match
        args.push(Box::new(format!("%\"{tag}\"%")));
        clauses.push(format!("tags LIKE ?{}", args.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        args.iter().map(|b| b.as_ref()).collect();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM memories {where_clause}"),
        param_refs.as_slice(),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {} FROM memories {where_clause} ORDER BY created_at DESC LIMIT {} OFFSET {}",
        Memory::COLUMNS,
        limit,
        offset
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut items = stmt
        .query_map(param_refs.as_slice(), Memory::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)?;

    for memory in &mut items {
        crate::memory::prune_reflection_refs(conn, memory)?;
    }

    Ok(ListPage {
        items,
        total: total as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::memory::store::store_memory;
    use crate::memory::types::MemoryContent;
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

    fn insert_fact(conn: &mut Connection, statement: &str, importance: f64, axis: usize) -> String {
        let content = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({ "statement": statement }),
        )
        .unwrap();
        store_memory(
            conn,
            &content,
            importance,
            &BTreeSet::new(),
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(axis),
            }],
            0.92,
        )
        .unwrap()
        .id
    }

    fn default_params() -> RetrievalParams {
        RetrievalParams {
            k: 5,
            candidate_multiplier: 4,
            rrf_k: 60,
            semantic_threshold: 0.3,
            semantic_weight: 0.6,
            recency_weight: 0.2,
            importance_weight: 0.2,
            hybrid: true,
        }
    }

    #[test]
    fn retrieve_finds_stored_fact() {
        let mut conn = test_db();
        let id = insert_fact(&mut conn, "Paris is the capital of France", 0.8, 0);
        insert_fact(&mut conn, "Rust has a borrow checker", 0.8, 1);

        let results = retrieve(
            &conn,
            "primary",
            &unit(0),
            "capital of France",
            &RetrievalFilter::default(),
            &default_params(),
            Utc::now(),
        )
        .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].memory.id, id);
        assert!(results[0].score >= 0.3);
    }

    #[test]
    fn both_legs_boost_fused_rank() {
        let vec_hits = vec![
            ("a".to_string(), 0.9),
            ("b".to_string(), 0.8),
            ("c".to_string(), 0.7),
        ];
        let lex_hits = vec![("b".to_string(), 5.0), ("d".to_string(), 3.0)];

        let merged = rrf_merge(&vec_hits, &lex_hits, 60);
        let scores: HashMap<String, f64> = merged.into_iter().collect();
        // b appears in both lists, so it outranks everything single-sourced
        assert!(scores["b"] > scores["a"]);
        assert!(scores["b"] > scores["d"]);
    }

    #[test]
    fn type_filter_restricts_results() {
        let mut conn = test_db();
        insert_fact(&mut conn, "A fact about databases", 0.8, 0);
        let convo = MemoryContent::parse(
            MemoryType::Conversation,
            serde_json::json!({"messages": [{"role": "user", "text": "databases are neat"}]}),
        )
        .unwrap();
        store_memory(
            &mut conn,
            &convo,
            0.5,
            &BTreeSet::new(),
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(1),
            }],
            0.92,
        )
        .unwrap();

        let filter = RetrievalFilter {
            types: Some(vec![MemoryType::Conversation]),
            ..Default::default()
        };
        let results = retrieve(
            &conn, "primary", &unit(1), "databases", &filter, &default_params(), Utc::now(),
        )
        .unwrap();

        assert!(!results.is_empty());
        for r in &results {
            assert_eq!(r.memory.memory_type, MemoryType::Conversation);
        }
    }

    #[test]
    fn tag_filter_any_match() {
        let mut conn = test_db();
        let content = MemoryContent::parse(
            MemoryType::Fact,
            serde_json::json!({"statement": "tagged fact"}),
        )
        .unwrap();
        let tags: BTreeSet<String> = ["geo".to_string()].into();
        store_memory(
            &mut conn,
            &content,
            0.5,
            &tags,
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(0),
            }],
            0.92,
        )
        .unwrap();
        insert_fact(&mut conn, "untagged fact", 0.5, 1);

        let filter = RetrievalFilter {
            tags: Some(vec!["geo".into(), "other".into()]),
            ..Default::default()
        };
        let results = retrieve(
            &conn, "primary", &unit(0), "fact", &filter, &default_params(), Utc::now(),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].memory.tags.contains("geo"));
    }

    #[test]
    fn empty_db_returns_empty() {
        let conn = test_db();
        let results = retrieve(
            &conn,
            "primary",
            &unit(0),
            "anything",
            &RetrievalFilter::default(),
            &default_params(),
            Utc::now(),
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn min_max_single_candidate_is_one() {
        let hits = vec![("only".to_string(), 0.42)];
        let normalized = min_max_normalize(&hits);
        assert_eq!(normalized["only"], 1.0);
    }

    #[test]
    fn escape_fts_query_quotes_terms() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(escape_fts_query("rust OR python"), "\"rust\" \"OR\" \"python\"");
        assert_eq!(escape_fts_query(""), "");
    }

    #[test]
    fn list_memories_paginates_with_total() {
        let mut conn = test_db();
        for i in 0..7 {
            insert_fact(&mut conn, &format!("fact number {i}"), 0.5, i % 4);
        }

        let page = list_memories(&conn, None, None, None, 3, 0).unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total, 7);

        let page2 = list_memories(&conn, None, None, None, 3, 6).unwrap();
        assert_eq!(page2.items.len(), 1);
        assert_eq!(page2.total, 7);
    }

    #[test]
    fn list_memories_filters_by_type_and_tier() {
        let mut conn = test_db();
        insert_fact(&mut conn, "a fact", 0.5, 0);
        let convo = MemoryContent::parse(
            MemoryType::Conversation,
            serde_json::json!({"messages": [{"role": "user", "text": "hi"}]}),
        )
        .unwrap();
        store_memory(
            &mut conn,
            &convo,
            0.5,
            &BTreeSet::new(),
            None,
            &[CollectionWrite {
                collection: "primary".into(),
                model: "hash-4".into(),
                embedding: unit(1),
            }],
            0.92,
        )
        .unwrap();

        let page = list_memories(&conn, Some(&[MemoryType::Fact]), None, None, 10, 0).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].memory_type, MemoryType::Fact);

        let page = list_memories(&conn, None, Some(Tier::ShortTerm), None, 10, 0).unwrap();
        assert_eq!(page.total, 2);

        let page = list_memories(&conn, None, Some(Tier::Archived), None, 10, 0).unwrap();
        assert_eq!(page.total, 0);
    }
}

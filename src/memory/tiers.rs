//! Temporal lifecycle — importance decay, tier transitions, and tier bounds.
//!
//! [`run_cycle`] is invoked by the engine's background loop. It applies
//! exponential importance decay scaled by the elapsed time since the last
//! cycle, then the transition rules, then enforces per-tier capacity bounds.
//! Every move goes through [`move_tier`], which enforces the transition graph
//! and keeps the lexical index membership in sync (archived memories carry no
//! FTS entry).

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{EngramError, Result};
use crate::memory::forget::expire_archived;
use crate::memory::store::{delete_fts, insert_fts, write_audit_log};
use crate::memory::types::Tier;

/// Knobs for one maintenance cycle. Mirrors the `[tiers]` config section.
#[derive(Debug, Clone)]
pub struct TierParams {
    pub short_term_threshold: f64,
    pub archival_threshold_days: u64,
    pub archived_retention_days: u64,
    pub max_short_term: usize,
    pub max_long_term: usize,
    pub decay_rate: f64,
    pub decay_floor: f64,
}

impl TierParams {
    pub fn from_config(tiers: &crate::config::TierConfig) -> Self {
        Self {
            short_term_threshold: tiers.short_term_threshold,
            archival_threshold_days: tiers.archival_threshold_days,
            archived_retention_days: tiers.archived_retention_days,
            max_short_term: tiers.max_short_term,
            max_long_term: tiers.max_long_term,
            decay_rate: tiers.decay_rate,
            decay_floor: tiers.decay_floor,
        }
    }
}

/// What one maintenance cycle did.
#[derive(Debug, Default, Serialize)]
pub struct CycleReport {
    pub decayed: usize,
    pub demoted_short_to_long: usize,
    pub demoted_long_to_archived: usize,
    pub promoted: usize,
    pub bound_demotions: usize,
    pub expired: usize,
}

/// Move a memory to a new tier, enforcing the transition graph.
pub fn move_tier(conn: &mut Connection, id: &str, target: Tier) -> Result<()> {
    let tx = conn.transaction().map_err(EngramError::from)?;

    let row: Option<(i64, String, String, String)> = tx
        .query_row(
            "SELECT rowid, tier, projection, type FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(EngramError::from)?;

    let Some((rowid, tier_str, projection, memory_type)) = row else {
        return Err(EngramError::not_found(format!("memory: {id}")));
    };
    let current: Tier = tier_str.parse()?;

    if !current.can_transition_to(target) {
        return Err(EngramError::InvalidTransition {
            from: current.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }

    tx.execute(
        "UPDATE memories SET tier = ?1, updated_at = ?2 WHERE id = ?3",
        params![target.as_str(), chrono::Utc::now().to_rfc3339(), id],
    )
    .map_err(EngramError::from)?;

    // Lexical index holds non-archived memories only
    if !projection.is_empty() {
        if target == Tier::Archived {
            delete_fts(&tx, rowid, &projection, id, &memory_type)?;
        } else if current == Tier::Archived {
            insert_fts(&tx, rowid, &projection, id, &memory_type)?;
        }
    }

    write_audit_log(
        &tx,
        "tier_move",
        id,
        Some(&serde_json::json!({"from": current.as_str(), "to": target.as_str()})),
    )?;

    tx.commit().map_err(EngramError::from)?;
    Ok(())
}

/// One full maintenance cycle: decay → rule-based transitions → bounds →
/// retention expiry.
pub fn run_cycle(
    conn: &mut Connection,
    params_cfg: &TierParams,
    now: DateTime<Utc>,
) -> Result<CycleReport> {
    let mut report = CycleReport::default();

    report.decayed = apply_decay(conn, params_cfg, now)?;

    // Promotion first: a memory accessed in the last six hours should not be
    // demoted by the rules below in the same cycle.
    report.promoted = promote_recently_accessed(conn, now)?;
    report.demoted_short_to_long = demote_cold_short_term(conn, params_cfg, now)?;
    report.demoted_long_to_archived = archive_idle_long_term(conn, params_cfg, now)?;

    report.bound_demotions = enforce_bound(
        conn,
        Tier::ShortTerm,
        Tier::LongTerm,
        params_cfg.max_short_term,
    )?;
    report.bound_demotions += enforce_bound(
        conn,
        Tier::LongTerm,
        Tier::Archived,
        params_cfg.max_long_term,
    )?;

    report.expired = expire_archived(conn, params_cfg.archived_retention_days, now)?;

    if report.decayed > 0 || report.promoted > 0 || report.expired > 0 {
        tracing::debug!(?report, "maintenance cycle complete");
    }
    Ok(report)
}

/// Multiply every non-archived importance by `exp(-rate * days)` where `days`
/// is the elapsed time since the previous cycle, flooring at `decay_floor`.
/// The cycle timestamp lives in `schema_meta` so restarts decay correctly.
fn apply_decay(conn: &Connection, params_cfg: &TierParams, now: DateTime<Utc>) -> Result<usize> {
    let last: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'last_decay_at'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(EngramError::from)?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('last_decay_at', ?1)",
        params![now.to_rfc3339()],
    )
    .map_err(EngramError::from)?;

    let Some(last) = last else {
        return Ok(0);
    };
    let Ok(last) = DateTime::parse_from_rfc3339(&last) else {
        return Ok(0);
    };

    let elapsed_days = (now - last.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0;
    if elapsed_days <= 0.0 {
        return Ok(0);
    }
    let factor = (-params_cfg.decay_rate * elapsed_days).exp();

    let affected = conn
        .execute(
            "UPDATE memories SET importance = MAX(?1, importance * ?2) \
             WHERE tier != 'archived' AND importance > ?1",
            params![params_cfg.decay_floor, factor],
        )
        .map_err(EngramError::from)?;

    if affected > 0 {
        write_audit_log(
            conn,
            "decay",
            "batch",
            Some(&serde_json::json!({"factor": factor, "affected": affected})),
        )?;
    }
    Ok(affected)
}

/// Promote memories accessed within the last six hours by one level.
fn promote_recently_accessed(conn: &mut Connection, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = (now - Duration::hours(6)).to_rfc3339();
    let candidates: Vec<(String, String)> = {
        let mut stmt = conn
            .prepare(
                "SELECT id, tier FROM memories \
                 WHERE tier != 'short_term' AND last_accessed_at >= ?1",
            )
            .map_err(EngramError::from)?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(EngramError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngramError::from)?;
        rows
    };

    let mut promoted = 0;
    for (id, tier_str) in candidates {
        let tier: Tier = tier_str.parse()?;
        if let Some(target) = tier.promoted() {
            move_tier(conn, &id, target)?;
            promoted += 1;
        }
    }
    Ok(promoted)
}

/// Demote short-term memories that have decayed below the threshold and are
/// older than a day.
fn demote_cold_short_term(
    conn: &mut Connection,
    params_cfg: &TierParams,
    now: DateTime<Utc>,
) -> Result<usize> {
    let age_cutoff = (now - Duration::days(1)).to_rfc3339();
    let recent_access_cutoff = (now - Duration::hours(6)).to_rfc3339();
    let candidates: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM memories \
                 WHERE tier = 'short_term' AND importance < ?1 AND created_at < ?2 \
                   AND (last_accessed_at IS NULL OR last_accessed_at < ?3)",
            )
            .map_err(EngramError::from)?;
        let rows = stmt
            .query_map(
                params![params_cfg.short_term_threshold, age_cutoff, recent_access_cutoff],
                |row| row.get(0),
            )
            .map_err(EngramError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngramError::from)?;
        rows
    };

    let count = candidates.len();
    for id in candidates {
        move_tier(conn, &id, Tier::LongTerm)?;
    }
    Ok(count)
}

/// Archive long-term memories with no access inside the archival window.
fn archive_idle_long_term(
    conn: &mut Connection,
    params_cfg: &TierParams,
    now: DateTime<Utc>,
) -> Result<usize> {
    let window_start = (now - Duration::days(params_cfg.archival_threshold_days as i64)).to_rfc3339();
    let candidates: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM memories \
                 WHERE tier = 'long_term' AND created_at < ?1 \
                   AND (last_accessed_at IS NULL OR last_accessed_at < ?1)",
            )
            .map_err(EngramError::from)?;
        let rows = stmt
            .query_map(params![window_start], |row| row.get(0))
            .map_err(EngramError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngramError::from)?;
        rows
    };

    let count = candidates.len();
    for id in candidates {
        move_tier(conn, &id, Tier::Archived)?;
    }
    Ok(count)
}

/// Demote the lowest-importance memories out of an over-full tier until the
/// bound holds. Ties break by oldest `last_accessed_at` (never-accessed
/// memories sort oldest).
fn enforce_bound(
    conn: &mut Connection,
    tier: Tier,
    target: Tier,
    max: usize,
) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM memories WHERE tier = ?1",
            params![tier.as_str()],
            |row| row.get(0),
        )
        .map_err(EngramError::from)?;

    let excess = (count as usize).saturating_sub(max);
    if excess == 0 {
        return Ok(0);
    }

    let victims: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM memories WHERE tier = ?1 \
                 ORDER BY importance ASC, last_accessed_at ASC NULLS FIRST, created_at ASC \
                 LIMIT ?2",
            )
            .map_err(EngramError::from)?;
        let rows = stmt
            .query_map(params![tier.as_str(), excess as i64], |row| row.get(0))
            .map_err(EngramError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngramError::from)?;
        rows
    };

    let count = victims.len();
    for id in victims {
        move_tier(conn, &id, target)?;
    }
    if count > 0 {
        tracing::info!(tier = %tier, demoted = count, "tier bound enforced");
    }
    Ok(count)
}

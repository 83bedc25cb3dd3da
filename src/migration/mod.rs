//! Dual-collection embedding migration controller.
//!
//! Replaces the active embedding model without downtime: a secondary vector
//! collection is created for the target model, writes go to both collections
//! from SHADOW onward, retrieval quality is compared on sampled canary
//! traffic, existing memories are re-embedded in batches during GRADUAL, and
//! the active pointer flips at FULL. Quality gates roll the whole thing back
//! if the secondary regresses.
//!
//! All transitions serialize on the controller mutex and persist the record
//! sidecar before returning.

pub mod quality;
pub mod state;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::config::MigrationConfig;
use crate::db::{collections, migrations};
use crate::embedding::EmbeddingProvider;
use crate::error::{EngramError, Result};
use quality::{quality_signal, ProbeRing};
use state::{MigrationPhase, MigrationRecord};

/// Backoff schedule for a failing GRADUAL batch; the batch is abandoned (ids
/// deferred) once the schedule is exhausted.
const BATCH_BACKOFF: [Duration; 5] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(4000),
];

/// Probe ring capacity.
const PROBE_CAPACITY: usize = 256;

/// Sidecar saves are batched during probe recording.
const PROBE_SAVE_EVERY: usize = 16;

pub struct MigrationController {
    record: Mutex<MigrationRecord>,
    sidecar: PathBuf,
    config: MigrationConfig,
    pub probes: ProbeRing,
}

impl MigrationController {
    /// Load the persisted record, or initialize a fresh inactive one.
    pub fn new(
        sidecar: PathBuf,
        config: MigrationConfig,
        primary_model: &str,
        primary_collection: &str,
    ) -> Result<Self> {
        let record = MigrationRecord::load(&sidecar)?
            .unwrap_or_else(|| MigrationRecord::new(primary_model, primary_collection));
        Ok(Self {
            record: Mutex::new(record),
            sidecar,
            config,
            probes: ProbeRing::new(PROBE_CAPACITY),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MigrationRecord> {
        self.record.lock().expect("migration record lock poisoned")
    }

    fn save(&self, record: &mut MigrationRecord) -> Result<()> {
        record.touch();
        record.save(&self.sidecar)
    }

    /// Snapshot of the current record.
    pub fn status(&self) -> MigrationRecord {
        self.lock().clone()
    }

    /// The model whose provider serves primary writes and reads.
    pub fn primary_model(&self) -> String {
        self.lock().primary_model.clone()
    }

    /// Secondary (collection, model) pair while dual-writes are on.
    pub fn dual_write_target(&self) -> Option<(String, String)> {
        let record = self.lock();
        if record.state.dual_writes() {
            Some((
                record.secondary_collection.clone()?,
                record.secondary_model.clone()?,
            ))
        } else {
            None
        }
    }

    /// Secondary collection to shadow a retrieval against, when canary
    /// sampling is live. The caller applies the sampling fraction.
    pub fn canary_target(&self) -> Option<(String, String)> {
        let record = self.lock();
        if record.state.samples_canary() {
            Some((
                record.secondary_collection.clone()?,
                record.secondary_model.clone()?,
            ))
        } else {
            None
        }
    }

    pub fn canary_fraction(&self) -> f64 {
        self.config.canary_fraction
    }

    /// Startup recovery: an interrupted migration whose secondary collection
    /// no longer exists cannot continue; reset it, keeping the reason.
    pub fn recover(&self, conn: &Connection) -> Result<()> {
        let mut record = self.lock();
        if !record.state.is_active() && record.state != MigrationPhase::Paused {
            return Ok(());
        }
        let secondary_ok = match &record.secondary_collection {
            Some(name) => collections::exists(conn, name)?,
            None => false,
        };
        if !secondary_ok {
            tracing::warn!(
                state = %record.state,
                "interrupted migration has no secondary collection; resetting"
            );
            reset_record(&mut record, "interrupted");
            self.save(&mut record)?;
        }
        Ok(())
    }

    /// Begin a migration to `target_model`. Legal only from INACTIVE.
    pub fn start(
        &self,
        conn: &Connection,
        target_model: &str,
        target_dimension: usize,
    ) -> Result<MigrationRecord> {
        let mut record = self.lock();
        if record.state != MigrationPhase::Inactive {
            return Err(EngramError::InvalidTransition {
                from: record.state.as_str().to_string(),
                to: MigrationPhase::Preparation.as_str().to_string(),
            });
        }
        if target_model == record.primary_model {
            return Err(EngramError::invalid_arguments(
                "target model is already the primary model",
            ));
        }

        let secondary_collection = collection_name_for(target_model);
        if collections::exists(conn, &secondary_collection)? {
            collections::drop(conn, &secondary_collection)?;
        }
        collections::create(conn, &secondary_collection, target_model, target_dimension)?;

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
            .map_err(EngramError::from)?;

        record.state = MigrationPhase::Preparation;
        record.secondary_model = Some(target_model.to_string());
        record.secondary_collection = Some(secondary_collection);
        record.started_at = Some(Utc::now().to_rfc3339());
        record.progress = state::MigrationProgress {
            migrated: 0,
            total: total as usize,
            deferred: Vec::new(),
        };
        record.quality = state::MigrationQuality::default();
        record.last_failure_reason = None;
        record.completed_at = None;
        record.last_checkpoint = Some("preparation".into());
        self.save(&mut record)?;

        tracing::info!(target = target_model, total, "migration started");
        Ok(record.clone())
    }

    /// Advance one edge along the state graph. The GRADUAL → FULL edge is
    /// gated on 100% coverage and the quality threshold; FULL → CLEANUP
    /// performs the destructive half (drop old primary, swap models).
    pub fn advance(
        &self,
        conn: &Connection,
        secondary_provider: Option<&dyn EmbeddingProvider>,
    ) -> Result<MigrationRecord> {
        let mut record = self.lock();
        match record.state {
            MigrationPhase::Preparation | MigrationPhase::Shadow | MigrationPhase::Canary => {
                let next = record.state.next().expect("active phase has a next");
                record.state = next;
                record.last_checkpoint = Some(next.as_str().to_string());
                self.save(&mut record)?;
                tracing::info!(state = %next, "migration advanced");
            }
            MigrationPhase::Gradual => {
                // Deferred ids get one more chance before the gate
                if !record.progress.deferred.is_empty() {
                    if let Some(provider) = secondary_provider {
                        retry_deferred(conn, &mut record, provider)?;
                    }
                }
                refresh_progress(conn, &mut record)?;

                let covered = record.progress.migrated >= record.progress.total
                    && record.progress.deferred.is_empty();
                let mean = record.quality.rolling_mean(self.config.min_quality_samples);
                if !covered || mean < self.config.quality_threshold {
                    self.save(&mut record)?;
                    return Err(EngramError::InvalidTransition {
                        from: "gradual".into(),
                        to: "full".into(),
                    });
                }

                let secondary = record
                    .secondary_collection
                    .clone()
                    .ok_or_else(|| EngramError::internal("gradual without secondary"))?;
                migrations::set_active_collection(conn, &secondary)
                    .map_err(EngramError::from)?;
                record.state = MigrationPhase::Full;
                record.last_checkpoint = Some("full".into());
                self.save(&mut record)?;
                tracing::info!(collection = %secondary, "active pointer flipped to secondary");
            }
            MigrationPhase::Full => {
                let old_primary = record.primary_collection.clone();
                let secondary = record
                    .secondary_collection
                    .clone()
                    .ok_or_else(|| EngramError::internal("full without secondary"))?;
                let secondary_model = record
                    .secondary_model
                    .clone()
                    .ok_or_else(|| EngramError::internal("full without secondary model"))?;

                collections::drop(conn, &old_primary)?;

                // Repoint every record at the surviving collection so no
                // embedding_ref dangles after the drop
                conn.execute(
                    "UPDATE memories SET embedding_ref = ?1, embedding_model = ?2 \
                     WHERE embedding_ref = ?3",
                    params![secondary, secondary_model, old_primary],
                )
                .map_err(EngramError::from)?;

                record.primary_model = secondary_model;
                record.primary_collection = secondary;
                record.secondary_model = None;
                record.secondary_collection = None;
                record.state = MigrationPhase::Cleanup;
                record.last_checkpoint = Some("cleanup".into());
                self.save(&mut record)?;
                tracing::info!(dropped = %old_primary, "old primary collection dropped");
            }
            MigrationPhase::Cleanup => {
                record.state = MigrationPhase::Inactive;
                record.completed_at = Some(Utc::now().to_rfc3339());
                record.last_checkpoint = Some("completed".into());
                self.save(&mut record)?;
                tracing::info!(model = %record.primary_model, "migration completed");
            }
            MigrationPhase::Inactive
            | MigrationPhase::RollingBack
            | MigrationPhase::Paused => {
                return Err(EngramError::InvalidTransition {
                    from: record.state.as_str().to_string(),
                    to: record
                        .state
                        .next()
                        .map(|p| p.as_str().to_string())
                        .unwrap_or_else(|| "advance".into()),
                });
            }
        }
        Ok(record.clone())
    }

    /// Pause an active migration. Pausing a paused migration is a no-op.
    pub fn pause(&self) -> Result<MigrationRecord> {
        let mut record = self.lock();
        match record.state {
            MigrationPhase::Paused => {}
            s if s.is_active() => {
                record.paused_from = Some(s);
                record.state = MigrationPhase::Paused;
                self.save(&mut record)?;
                tracing::info!(from = %s, "migration paused");
            }
            s => {
                return Err(EngramError::InvalidTransition {
                    from: s.as_str().to_string(),
                    to: MigrationPhase::Paused.as_str().to_string(),
                });
            }
        }
        Ok(record.clone())
    }

    /// Resume a paused migration. Resuming a running migration is a no-op.
    pub fn resume(&self) -> Result<MigrationRecord> {
        let mut record = self.lock();
        match record.state {
            MigrationPhase::Paused => {
                let target = record.paused_from.take().unwrap_or(MigrationPhase::Inactive);
                record.state = target;
                self.save(&mut record)?;
                tracing::info!(to = %target, "migration resumed");
            }
            s if s.is_active() => {}
            s => {
                return Err(EngramError::InvalidTransition {
                    from: s.as_str().to_string(),
                    to: "resume".into(),
                });
            }
        }
        Ok(record.clone())
    }

    /// Roll back: stop dual-writes, drop the secondary collection, restore
    /// the active pointer, and reset the record to INACTIVE keeping the
    /// failure reason.
    pub fn rollback(&self, conn: &Connection, reason: &str) -> Result<MigrationRecord> {
        let mut record = self.lock();
        if !record.state.is_active() && record.state != MigrationPhase::Paused {
            return Err(EngramError::InvalidTransition {
                from: record.state.as_str().to_string(),
                to: MigrationPhase::RollingBack.as_str().to_string(),
            });
        }

        record.state = MigrationPhase::RollingBack;
        self.save(&mut record)?;

        if let Some(secondary) = record.secondary_collection.clone() {
            collections::drop(conn, &secondary)?;
        }
        // Restore the pointer if FULL had flipped it
        migrations::set_active_collection(conn, &record.primary_collection)
            .map_err(EngramError::from)?;

        reset_record(&mut record, reason);
        self.save(&mut record)?;
        tracing::warn!(reason, "migration rolled back");
        Ok(record.clone())
    }

    /// Record one canary probe comparing primary vs secondary retrieval.
    pub fn record_probe(
        &self,
        primary_hits: &[(String, f64)],
        secondary_hits: &[(String, f64)],
    ) -> f64 {
        let score = quality_signal(primary_hits, secondary_hits);
        let mut record = self.lock();
        record.quality.record(score);
        record.quality.primary_score = primary_hits
            .iter()
            .take(10)
            .map(|(_, s)| s.clamp(0.0, 1.0))
            .sum::<f64>()
            / primary_hits.len().clamp(1, 10) as f64;
        if record.quality.samples % PROBE_SAVE_EVERY == 0 {
            let _ = self.save(&mut record);
        }
        score
    }

    /// Background step: enforce the time and quality gates, then run one
    /// GRADUAL batch if the migration is in GRADUAL.
    pub fn tick(
        &self,
        conn: &mut Connection,
        secondary_provider: Option<&dyn EmbeddingProvider>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (state, breach) = {
            let record = self.lock();
            (record.state, self.gate_breach(&record, now))
        };

        if !state.is_active() {
            return Ok(());
        }

        if let Some(reason) = breach {
            self.rollback(conn, &reason)?;
            return Ok(());
        }

        if state == MigrationPhase::Gradual {
            if let Some(provider) = secondary_provider {
                self.run_gradual_batch(conn, provider)?;
            }
        }
        Ok(())
    }

    fn gate_breach(&self, record: &MigrationRecord, now: DateTime<Utc>) -> Option<String> {
        if let Some(started) = record
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let elapsed = now - started.with_timezone(&Utc);
            if elapsed > chrono::Duration::hours(self.config.max_time_hours as i64) {
                return Some("time_limit_exceeded".into());
            }
        }
        if record.quality.samples >= self.config.min_quality_samples
            && record.quality.rolling_mean(self.config.min_quality_samples)
                < self.config.rollback_threshold
        {
            return Some("quality_regression".into());
        }
        None
    }

    /// Re-embed one batch of memories that are still missing from the
    /// secondary collection. A batch that keeps failing after the backoff
    /// schedule is abandoned and its ids deferred.
    pub fn run_gradual_batch(
        &self,
        conn: &Connection,
        provider: &dyn EmbeddingProvider,
    ) -> Result<usize> {
        let mut record = self.lock();
        if record.state != MigrationPhase::Gradual {
            return Ok(0);
        }
        let secondary = record
            .secondary_collection
            .clone()
            .ok_or_else(|| EngramError::internal("gradual without secondary"))?;

        let deferred = record.progress.deferred.clone();
        let batch = fetch_unmigrated(
            conn,
            &secondary,
            self.config.batch_size,
            &deferred,
        )?;
        if batch.is_empty() {
            refresh_progress(conn, &mut record)?;
            self.save(&mut record)?;
            return Ok(0);
        }

        let migrated = migrate_batch(conn, &secondary, provider, &batch);
        match migrated {
            Ok(count) => {
                refresh_progress(conn, &mut record)?;
                record.last_checkpoint = Some(format!(
                    "gradual:{}/{}",
                    record.progress.migrated, record.progress.total
                ));
                self.save(&mut record)?;
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, batch = batch.len(), "gradual batch abandoned");
                record
                    .progress
                    .deferred
                    .extend(batch.into_iter().map(|(id, _)| id));
                self.save(&mut record)?;
                Ok(0)
            }
        }
    }
}

fn reset_record(record: &mut MigrationRecord, reason: &str) {
    record.state = MigrationPhase::Inactive;
    record.secondary_model = None;
    record.secondary_collection = None;
    record.started_at = None;
    record.progress = state::MigrationProgress::default();
    record.quality = state::MigrationQuality::default();
    record.paused_from = None;
    record.last_failure_reason = Some(reason.to_string());
}

/// Secondary collection name derived from the target model id.
fn collection_name_for(model: &str) -> String {
    let mut name = String::from("mig_");
    for c in model.chars().take(48) {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else {
            name.push('_');
        }
    }
    name
}

/// Memories with no vector in the secondary collection yet, skipping deferred
/// ids, oldest first.
fn fetch_unmigrated(
    conn: &Connection,
    secondary: &str,
    limit: usize,
    deferred: &[String],
) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT m.id, m.projection FROM memories m \
             WHERE m.id NOT IN (SELECT id FROM vec_{secondary}) \
             ORDER BY m.created_at ASC LIMIT ?1"
        ))
        .map_err(EngramError::from)?;
    let rows = stmt
        .query_map(params![(limit + deferred.len()) as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(EngramError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)?;
    Ok(rows
        .into_iter()
        .filter(|(id, _)| !deferred.contains(id))
        .take(limit)
        .collect())
}

/// Embed and upsert one batch with the backoff schedule.
fn migrate_batch(
    conn: &Connection,
    secondary: &str,
    provider: &dyn EmbeddingProvider,
    batch: &[(String, String)],
) -> Result<usize> {
    let texts: Vec<&str> = batch.iter().map(|(_, p)| p.as_str()).collect();

    let mut last_err: Option<EngramError> = None;
    for (attempt, backoff) in BATCH_BACKOFF.iter().enumerate() {
        let result = provider
            .embed_batch(&texts)
            .map_err(|e| EngramError::backend(format!("re-embed batch: {e}")))
            .and_then(|embeddings| {
                for ((id, _), embedding) in batch.iter().zip(embeddings.iter()) {
                    collections::upsert_vector(conn, secondary, id, embedding)?;
                }
                Ok(batch.len())
            });
        match result {
            Ok(count) => return Ok(count),
            Err(e) if e.is_transient() => {
                tracing::debug!(attempt, error = %e, "gradual batch retry");
                last_err = Some(e);
                std::thread::sleep(*backoff);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| EngramError::backend("batch retries exhausted")))
}

/// Give deferred ids one final attempt, individually.
fn retry_deferred(
    conn: &Connection,
    record: &mut MigrationRecord,
    provider: &dyn EmbeddingProvider,
) -> Result<()> {
    let secondary = record
        .secondary_collection
        .clone()
        .ok_or_else(|| EngramError::internal("deferred retry without secondary"))?;
    let deferred = std::mem::take(&mut record.progress.deferred);
    for id in deferred {
        let projection: Option<String> = conn
            .query_row(
                "SELECT projection FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .ok();
        let Some(projection) = projection else {
            continue; // deleted since deferral
        };
        match provider
            .embed(&projection)
            .map_err(|e| EngramError::backend(e.to_string()))
            .and_then(|v| collections::upsert_vector(conn, &secondary, &id, &v))
        {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "deferred id failed final retry");
                record.progress.deferred.push(id);
            }
        }
    }
    Ok(())
}

/// Recompute coverage from the secondary collection itself.
fn refresh_progress(conn: &Connection, record: &mut MigrationRecord) -> Result<()> {
    let Some(secondary) = record.secondary_collection.clone() else {
        return Ok(());
    };
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .map_err(EngramError::from)?;
    let migrated: i64 = conn
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM memories m \
                 WHERE m.id IN (SELECT id FROM vec_{secondary})"
            ),
            [],
            |row| row.get(0),
        )
        .map_err(EngramError::from)?;
    record.progress.total = total as usize;
    record.progress.migrated = migrated as usize;
    Ok(())
}

//! Batched access side-effects.
//!
//! Every id returned from retrieval gets `access_count += 1`,
//! `last_accessed_at = now`, and an importance bump
//! `importance ← min(1, importance + α·(1 − importance))`. Updates are
//! buffered in a single-consumer task and flushed when the buffer reaches the
//! size bound or the flush interval elapses, whichever comes first. Updates
//! apply in receipt order, so concurrent retrievals reconcile deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Importance bump factor per consumed access.
pub const ACCESS_ALPHA: f64 = 0.02;

enum Msg {
    Touch(Vec<String>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the batcher task. Cheap to clone; dropping every handle drains
/// the buffer and stops the task.
#[derive(Clone)]
pub struct AccessBatcher {
    tx: mpsc::Sender<Msg>,
}

impl AccessBatcher {
    /// Spawn the consumer task. Returns the handle pair; the `JoinHandle`
    /// completes after the final drain when all senders are dropped.
    /// `queue_size` bounds in-flight batches; overflow batches are dropped.
    pub fn spawn(
        db: Arc<Mutex<Connection>>,
        flush_interval: Duration,
        flush_size: usize,
        queue_size: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Msg>(queue_size.max(1));

        let handle = tokio::spawn(async move {
            let mut pending: Vec<String> = Vec::new();
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(Msg::Touch(ids)) => {
                            pending.extend(ids);
                            if pending.len() >= flush_size {
                                flush_pending(&db, &mut pending).await;
                            }
                        }
                        Some(Msg::Flush(ack)) => {
                            flush_pending(&db, &mut pending).await;
                            let _ = ack.send(());
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            flush_pending(&db, &mut pending).await;
                        }
                    }
                }
            }
            // Final drain before the task exits
            flush_pending(&db, &mut pending).await;
        });

        (Self { tx }, handle)
    }

    /// Record consumed accesses for a batch of returned ids.
    pub fn touch_all(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        // A full queue or a gone task drops the batch rather than blocking
        // the retrieval path.
        if let Err(e) = self.tx.try_send(Msg::Touch(ids)) {
            tracing::warn!(error = %e, "access update batch dropped");
        }
    }

    /// Force a flush and wait for it. Used on drain and by tests.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn flush_pending(db: &Arc<Mutex<Connection>>, pending: &mut Vec<String>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let db = Arc::clone(db);
    let result = tokio::task::spawn_blocking(move || apply_batch(&db, &batch)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "access batch flush failed"),
        Err(e) => tracing::warn!(error = %e, "access batch task failed"),
    }
}

fn apply_batch(db: &Arc<Mutex<Connection>>, ids: &[String]) -> anyhow::Result<()> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for id in ids {
        *counts.entry(id.as_str()).or_insert(0) += 1;
    }

    let conn = db
        .lock()
        .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
    let now = chrono::Utc::now().to_rfc3339();
    let mut bump = conn.prepare(
        "UPDATE memories SET importance = MIN(1.0, importance + ?1 * (1.0 - importance)) \
         WHERE id = ?2",
    )?;
    let mut touch = conn.prepare(
        "UPDATE memories SET access_count = access_count + ?1, last_accessed_at = ?2 \
         WHERE id = ?3",
    )?;
    for (id, n) in counts {
        // The importance bump compounds, so it applies once per access
        for _ in 0..n {
            bump.execute(params![ACCESS_ALPHA, id])?;
        }
        touch.execute(params![n, now, id])?;
    }
    Ok(())
}

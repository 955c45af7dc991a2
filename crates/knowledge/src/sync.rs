//! Relational ↔ vector consistency.
//!
//! The relational store is the truth; the vector collection is a
//! derived index. Reconciliation scans for notes whose `updated_at`
//! has passed `vector_synced_at`, re-embeds them one at a time (which
//! serializes upserts per note), and purges vector rows whose notes
//! are gone. Passes are idempotent and safe alongside live writes:
//! the sync mark is guarded by the `updated_at` observed before
//! embedding, so a concurrent edit simply leaves the note dirty for
//! the next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use notevault_ai::EmbeddingAdapter;
use notevault_store::{Store, rusqlite};
use notevault_vector::{VectorRecord, VectorStore};

use crate::KnowledgeError;
use crate::note::embed_text;

/// Per-pass bound on re-embedded notes; a deep backlog drains over
/// consecutive passes instead of starving the write path.
const RECONCILE_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    /// Content hash already current; only the sync mark advanced.
    pub skipped: usize,
    pub purged: usize,
    /// Budget frozen; left dirty for a later pass.
    pub deferred: usize,
}

pub struct SyncCoordinator {
    store: Store,
    vector: VectorStore,
    embedder: Arc<EmbeddingAdapter>,
    wake: Arc<Notify>,
    interval: Duration,
}

impl SyncCoordinator {
    pub fn new(
        store: Store,
        vector: VectorStore,
        embedder: Arc<EmbeddingAdapter>,
        wake: Arc<Notify>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            vector,
            embedder,
            wake,
            interval,
        }
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Long-running loop: reconcile at startup, then on every write
    /// wake or interval tick, until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.reconcile().await {
            warn!(error = %err, "startup reconciliation failed");
        }
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("sync coordinator stopping");
                        return;
                    }
                }
            }
            match self.reconcile().await {
                Ok(report)
                    if report.upserted + report.skipped + report.purged + report.deferred > 0 =>
                {
                    info!(
                        upserted = report.upserted,
                        skipped = report.skipped,
                        purged = report.purged,
                        deferred = report.deferred,
                        "reconciliation pass complete"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "reconciliation pass failed"),
            }
        }
    }

    /// One full pass: re-embed dirty notes, then purge vector rows
    /// for deleted notes.
    pub async fn reconcile(&self) -> Result<ReconcileReport, KnowledgeError> {
        let mut report = ReconcileReport::default();

        let dirty: Vec<(String, String, String, String)> = self
            .store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT note_id, title, body, updated_at FROM notes
                     WHERE deleted_at IS NULL
                       AND (vector_synced_at IS NULL OR vector_synced_at < updated_at)
                     ORDER BY updated_at ASC, note_id ASC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([RECONCILE_BATCH as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        for (note_id, title, body, observed_updated_at) in dirty {
            let outcome = self.embedder.embed_one(&embed_text(&title, &body)).await?;
            if outcome.degraded {
                // The whole pass shares one budget; stop asking.
                report.deferred += 1;
                break;
            }

            let current = self
                .vector
                .get(&note_id)
                .await?
                .map(|record| record.content_hash == outcome.content_hash)
                .unwrap_or(false);
            if current {
                report.skipped += 1;
            } else {
                self.vector
                    .upsert(VectorRecord {
                        note_id: note_id.clone(),
                        vector: outcome.vector,
                        content_hash: outcome.content_hash,
                        metadata: std::collections::BTreeMap::from([(
                            "title".to_string(),
                            title.clone(),
                        )]),
                    })
                    .await?;
                report.upserted += 1;
            }

            // Guarded mark: a concurrent edit keeps the note dirty.
            let id = note_id.clone();
            let now = mark_ts(Utc::now());
            self.store
                .with_conn(move |conn| {
                    conn.execute(
                        "UPDATE notes SET vector_synced_at = ?1
                         WHERE note_id = ?2 AND updated_at = ?3",
                        rusqlite::params![now, id, observed_updated_at],
                    )?;
                    Ok(())
                })
                .await?;
            debug!(note_id, "vector index synchronized");
        }

        report.purged += self.purge_stale_vectors().await?;
        Ok(report)
    }

    /// Delete vector rows whose notes are tombstoned or missing.
    async fn purge_stale_vectors(&self) -> Result<usize, KnowledgeError> {
        let vector_ids = self.vector.note_ids().await?;
        if vector_ids.is_empty() {
            return Ok(0);
        }
        let ids = vector_ids.clone();
        let live: Vec<String> = self
            .store
            .with_conn(move |conn| {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT note_id FROM notes
                     WHERE deleted_at IS NULL AND note_id IN ({placeholders})"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut purged = 0;
        for note_id in vector_ids {
            if !live.contains(&note_id) && self.vector.delete(&note_id).await? {
                debug!(note_id, "stale vector purged");
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn mark_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

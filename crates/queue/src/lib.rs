//! Durable FIFO-with-priority work queue.
//!
//! Two relational tables (`queue_items`, `dead_items`) hold every
//! outbound artifact until a worker confirms it reached the remote.
//! Delivery is at-least-once: producers supply idempotency keys,
//! workers hold time-bounded leases, and failed items retry with a
//! jittered exponential backoff until they dead-letter.
//!
//! ```text
//! pending ──lease──▶ leased ──complete──▶ done
//!    ▲                 │ fail
//!    │◀── backoff ─────┤
//!    │                 └── attempts exceeded ──▶ dead_items
//!    └── lease expiry (reap)
//! ```

mod backoff;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notevault_store::{Store, StoreError, rusqlite};

pub use backoff::{MAX_BACKOFF, backoff_for_attempt};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Soft cap exceeded; callers translate this into "try again
    /// later" feedback.
    #[error("queue over soft cap ({pending} items pending)")]
    Backpressure { pending: usize },
    #[error("dead item {0} not found")]
    DeadItemNotFound(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Failures beyond this move the item to `dead_items`.
    pub max_attempts: u32,
    /// Pending-item count above which enqueue refuses new work.
    pub soft_cap: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            soft_cap: 10_000,
        }
    }
}

/// A work item handed to exactly one worker for the lease duration.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    pub seq: i64,
    pub payload: Vec<u8>,
    pub lease_token: String,
    pub attempts: u32,
    pub priority: i64,
}

/// Outcome of a `fail` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Back to pending, visible again at the given time.
    Requeued {
        attempts: u32,
        visible_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; archived in `dead_items`.
    DeadLettered,
    /// The (seq, lease_token) pair no longer holds a lease: the call
    /// was late or raced another disposition. No-op.
    NotLeased,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub done: usize,
    pub dead: usize,
}

#[derive(Debug, Clone)]
pub struct DeadItem {
    pub seq: i64,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i64,
    pub attempts: u32,
    pub idempotency_key: Option<String>,
    pub payload: Vec<u8>,
    pub final_error: Option<String>,
    pub moved_at: DateTime<Utc>,
}

enum EnqueueOutcome {
    Inserted(i64),
    Deduplicated(i64),
    OverCap(usize),
}

/// Fixed-width UTC timestamp so string comparison in SQL is time
/// comparison.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Clone)]
pub struct Queue {
    store: Store,
    settings: QueueSettings,
    wake: Arc<Notify>,
}

impl Queue {
    pub fn new(store: Store, settings: QueueSettings) -> Self {
        Self {
            store,
            settings,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Insert a pending item and return its `seq`.
    ///
    /// When `idempotency_key` matches an existing non-terminal row the
    /// existing `seq` is returned and nothing is inserted. Above the
    /// soft cap the call fails with [`QueueError::Backpressure`].
    pub async fn enqueue(
        &self,
        payload: Vec<u8>,
        priority: i64,
        idempotency_key: Option<String>,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<i64, QueueError> {
        let soft_cap = self.settings.soft_cap;
        let outcome = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let pending: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM queue_items WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )?;
                if pending as usize >= soft_cap {
                    return Ok(EnqueueOutcome::OverCap(pending as usize));
                }

                if let Some(key) = &idempotency_key {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT seq FROM queue_items
                             WHERE idempotency_key = ?1 AND status IN ('pending', 'leased')",
                            [key],
                            |row| row.get(0),
                        )
                        .map(Some)
                        .or_else(|err| match err {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?;
                    if let Some(seq) = existing {
                        return Ok(EnqueueOutcome::Deduplicated(seq));
                    }
                }

                let now = Utc::now();
                tx.execute(
                    "INSERT INTO queue_items
                       (enqueued_at, visible_at, priority, attempts, status,
                        idempotency_key, payload)
                     VALUES (?1, ?2, ?3, 0, 'pending', ?4, ?5)",
                    rusqlite::params![
                        ts(now),
                        ts(visible_at.unwrap_or(now)),
                        priority,
                        idempotency_key,
                        payload,
                    ],
                )?;
                let seq = tx.last_insert_rowid();
                tx.commit()?;
                Ok(EnqueueOutcome::Inserted(seq))
            })
            .await?;

        match outcome {
            EnqueueOutcome::Inserted(seq) => {
                debug!(seq, priority, "queue item enqueued");
                self.wake.notify_one();
                Ok(seq)
            }
            EnqueueOutcome::Deduplicated(seq) => {
                debug!(seq, "enqueue deduplicated by idempotency key");
                Ok(seq)
            }
            EnqueueOutcome::OverCap(pending) => Err(QueueError::Backpressure { pending }),
        }
    }

    /// Atomically claim up to `batch_size` visible pending items,
    /// ordered by `(priority DESC, seq ASC)`.
    pub async fn lease(
        &self,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<LeasedItem>, QueueError> {
        let items = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let candidates: Vec<(i64, Vec<u8>, u32, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT seq, payload, attempts, priority FROM queue_items
                         WHERE status = 'pending' AND visible_at <= ?1
                         ORDER BY priority DESC, seq ASC
                         LIMIT ?2",
                    )?;
                    stmt.query_map(rusqlite::params![ts(now), batch_size as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                };

                let expires = ts(now + chrono::Duration::from_std(lease_duration).unwrap_or_default());
                let mut leased = Vec::with_capacity(candidates.len());
                for (seq, payload, attempts, priority) in candidates {
                    let token = Uuid::new_v4().to_string();
                    tx.execute(
                        "UPDATE queue_items
                         SET status = 'leased', lease_token = ?1, lease_expires_at = ?2
                         WHERE seq = ?3",
                        rusqlite::params![token, expires, seq],
                    )?;
                    leased.push(LeasedItem {
                        seq,
                        payload,
                        lease_token: token,
                        attempts,
                        priority,
                    });
                }
                tx.commit()?;
                Ok(leased)
            })
            .await?;

        if !items.is_empty() {
            debug!(count = items.len(), "queue items leased");
        }
        Ok(items)
    }

    /// Mark an item done. Returns `false` (a no-op) when the lease
    /// token does not match or the item is no longer leased, so a
    /// second `complete` for the same lease never double-fires.
    pub async fn complete(&self, seq: i64, lease_token: &str) -> Result<bool, QueueError> {
        let token = lease_token.to_string();
        let changed = self
            .store
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE queue_items
                     SET status = 'done', lease_token = NULL, lease_expires_at = NULL
                     WHERE seq = ?1 AND lease_token = ?2 AND status = 'leased'",
                    rusqlite::params![seq, token],
                )?;
                Ok(changed > 0)
            })
            .await?;
        if changed {
            debug!(seq, "queue item completed");
        }
        Ok(changed)
    }

    /// Record a failure: increments `attempts`, schedules the retry
    /// `backoff` from now (clamped to [`MAX_BACKOFF`]), and
    /// dead-letters the item once attempts exceed the ceiling.
    pub async fn fail(
        &self,
        seq: i64,
        lease_token: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<Disposition, QueueError> {
        let token = lease_token.to_string();
        let error = error.to_string();
        let max_attempts = self.settings.max_attempts;
        let backoff = backoff.min(MAX_BACKOFF);

        let disposition = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let row: Option<(u32, String, i64, Option<String>, Vec<u8>)> = tx
                    .query_row(
                        "SELECT attempts, enqueued_at, priority, idempotency_key, payload
                         FROM queue_items
                         WHERE seq = ?1 AND lease_token = ?2 AND status = 'leased'",
                        rusqlite::params![seq, token],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                            ))
                        },
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let Some((attempts, enqueued_at, priority, idempotency_key, payload)) = row else {
                    return Ok(Disposition::NotLeased);
                };

                let attempts = attempts + 1;
                let now = Utc::now();
                if attempts > max_attempts {
                    tx.execute(
                        "INSERT INTO dead_items
                           (seq, enqueued_at, priority, attempts, idempotency_key,
                            payload, final_error, moved_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        rusqlite::params![
                            seq,
                            enqueued_at,
                            priority,
                            attempts,
                            idempotency_key,
                            payload,
                            error,
                            ts(now),
                        ],
                    )?;
                    tx.execute("DELETE FROM queue_items WHERE seq = ?1", [seq])?;
                    tx.commit()?;
                    return Ok(Disposition::DeadLettered);
                }

                let visible_at =
                    now + chrono::Duration::from_std(backoff).unwrap_or_default();
                tx.execute(
                    "UPDATE queue_items
                     SET status = 'pending', attempts = ?1, visible_at = ?2,
                         last_error = ?3, lease_token = NULL, lease_expires_at = NULL
                     WHERE seq = ?4",
                    rusqlite::params![attempts, ts(visible_at), error, seq],
                )?;
                tx.commit()?;
                Ok(Disposition::Requeued { attempts, visible_at })
            })
            .await?;

        match &disposition {
            Disposition::Requeued { attempts, visible_at } => {
                debug!(seq, attempts, visible_at = %visible_at, "queue item requeued");
            }
            Disposition::DeadLettered => {
                warn!(seq, "queue item dead-lettered");
            }
            Disposition::NotLeased => {
                debug!(seq, "fail ignored: lease no longer held");
            }
        }
        Ok(disposition)
    }

    /// Return expired leases to pending. Each expiry event charges one
    /// attempt; items past the retry ceiling dead-letter here too.
    pub async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let max_attempts = self.settings.max_attempts;
        let reaped = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let expired: Vec<(i64, u32, String, i64, Option<String>, Vec<u8>)> = {
                    let mut stmt = tx.prepare(
                        "SELECT seq, attempts, enqueued_at, priority, idempotency_key, payload
                         FROM queue_items
                         WHERE status = 'leased' AND lease_expires_at <= ?1",
                    )?;
                    stmt.query_map([ts(now)], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                };

                let count = expired.len();
                for (seq, attempts, enqueued_at, priority, idempotency_key, payload) in expired {
                    let attempts = attempts + 1;
                    if attempts > max_attempts {
                        tx.execute(
                            "INSERT INTO dead_items
                               (seq, enqueued_at, priority, attempts, idempotency_key,
                                payload, final_error, moved_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'lease expired', ?7)",
                            rusqlite::params![
                                seq,
                                enqueued_at,
                                priority,
                                attempts,
                                idempotency_key,
                                payload,
                                ts(now),
                            ],
                        )?;
                        tx.execute("DELETE FROM queue_items WHERE seq = ?1", [seq])?;
                    } else {
                        tx.execute(
                            "UPDATE queue_items
                             SET status = 'pending', attempts = ?1, visible_at = ?2,
                                 last_error = 'lease expired',
                                 lease_token = NULL, lease_expires_at = NULL
                             WHERE seq = ?3",
                            rusqlite::params![attempts, ts(now), seq],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await?;

        if reaped > 0 {
            self.wake.notify_one();
        }
        Ok(reaped)
    }

    /// Crash recovery, run once at process start.
    pub async fn recover_on_startup(&self) -> Result<usize, QueueError> {
        let reaped = self.reap_expired_leases().await?;
        info!(reaped, "queue startup recovery complete");
        Ok(reaped)
    }

    /// Move a dead item back to pending under a fresh `seq`. The
    /// idempotency key is dropped if an active item already holds it.
    pub async fn replay_dead(&self, dead_seq: i64) -> Result<i64, QueueError> {
        let outcome = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let row: Option<(String, i64, Option<String>, Vec<u8>)> = tx
                    .query_row(
                        "SELECT enqueued_at, priority, idempotency_key, payload
                         FROM dead_items WHERE seq = ?1",
                        [dead_seq],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let Some((enqueued_at, priority, idempotency_key, payload)) = row else {
                    return Ok(None);
                };

                let key = match &idempotency_key {
                    Some(key) => {
                        let conflict: i64 = tx.query_row(
                            "SELECT COUNT(*) FROM queue_items
                             WHERE idempotency_key = ?1 AND status IN ('pending', 'leased')",
                            [key],
                            |row| row.get(0),
                        )?;
                        if conflict > 0 { None } else { idempotency_key.clone() }
                    }
                    None => None,
                };

                tx.execute(
                    "INSERT INTO queue_items
                       (enqueued_at, visible_at, priority, attempts, status,
                        idempotency_key, payload)
                     VALUES (?1, ?2, ?3, 0, 'pending', ?4, ?5)",
                    rusqlite::params![enqueued_at, ts(Utc::now()), priority, key, payload],
                )?;
                let new_seq = tx.last_insert_rowid();
                tx.execute("DELETE FROM dead_items WHERE seq = ?1", [dead_seq])?;
                tx.commit()?;
                Ok(Some(new_seq))
            })
            .await?;

        match outcome {
            Some(new_seq) => {
                info!(dead_seq, new_seq, "dead item replayed");
                self.wake.notify_one();
                Ok(new_seq)
            }
            None => Err(QueueError::DeadItemNotFound(dead_seq)),
        }
    }

    pub async fn list_dead(&self, limit: usize) -> Result<Vec<DeadItem>, QueueError> {
        let items = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, enqueued_at, priority, attempts, idempotency_key,
                            payload, final_error, moved_at
                     FROM dead_items ORDER BY moved_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok(DeadItem {
                            seq: row.get(0)?,
                            enqueued_at: parse_ts(&row.get::<_, String>(1)?),
                            priority: row.get(2)?,
                            attempts: row.get(3)?,
                            idempotency_key: row.get(4)?,
                            payload: row.get(5)?,
                            final_error: row.get(6)?,
                            moved_at: parse_ts(&row.get::<_, String>(7)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(items)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let stats = self
            .store
            .with_conn(|conn| {
                let mut stats = QueueStats::default();
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (status, count) in rows {
                    match status.as_str() {
                        "pending" => stats.pending = count as usize,
                        "leased" => stats.leased = count as usize,
                        "done" => stats.done = count as usize,
                        _ => {}
                    }
                }
                stats.dead = conn
                    .query_row("SELECT COUNT(*) FROM dead_items", [], |row| row.get::<_, i64>(0))?
                    as usize;
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }

    /// Block until new work is enqueued or `timeout` elapses.
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use notevault_store::StoreOptions;

    fn queue() -> Queue {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        Queue::new(store, QueueSettings::default())
    }

    fn queue_with(settings: QueueSettings) -> Queue {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        Queue::new(store, settings)
    }

    #[tokio::test]
    async fn equal_priority_items_lease_in_enqueue_order() {
        let q = queue();
        let a = q.enqueue(b"a".to_vec(), 0, None, None).await.unwrap();
        let b = q.enqueue(b"b".to_vec(), 0, None, None).await.unwrap();
        let c = q.enqueue(b"c".to_vec(), 0, None, None).await.unwrap();

        let leased = q.lease(10, Duration::from_secs(30)).await.unwrap();
        let seqs: Vec<i64> = leased.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![a, b, c]);
    }

    #[tokio::test]
    async fn higher_priority_leases_first() {
        let q = queue();
        q.enqueue(b"low".to_vec(), 0, None, None).await.unwrap();
        q.enqueue(b"high".to_vec(), 5, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased[0].payload, b"high".to_vec());
    }

    #[tokio::test]
    async fn idempotency_key_yields_one_nonterminal_item() {
        let q = queue();
        let first = q
            .enqueue(b"x".to_vec(), 0, Some("k1".to_string()), None)
            .await
            .unwrap();
        for _ in 0..5 {
            let again = q
                .enqueue(b"x".to_vec(), 0, Some("k1".to_string()), None)
                .await
                .unwrap();
            assert_eq!(again, first);
        }
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 1);

        // Once terminal, the key is reusable.
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert!(q.complete(first, &leased[0].lease_token).await.unwrap());
        let fresh = q
            .enqueue(b"x".to_vec(), 0, Some("k1".to_string()), None)
            .await
            .unwrap();
        assert_ne!(fresh, first);
    }

    #[tokio::test]
    async fn complete_requires_matching_lease_token_and_is_single_shot() {
        let q = queue();
        let seq = q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();

        assert!(!q.complete(seq, "wrong-token").await.unwrap());
        assert!(q.complete(seq, &leased[0].lease_token).await.unwrap());
        // Second call with the same token is a no-op.
        assert!(!q.complete(seq, &leased[0].lease_token).await.unwrap());
    }

    #[tokio::test]
    async fn failed_item_backs_off_then_becomes_leasable() {
        let q = queue();
        let seq = q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();

        let disposition = q
            .fail(seq, &leased[0].lease_token, "push failed", Duration::from_millis(20))
            .await
            .unwrap();
        let Disposition::Requeued { attempts, visible_at } = disposition else {
            panic!("expected requeue, got {disposition:?}");
        };
        assert_eq!(attempts, 1);
        assert!(visible_at > Utc::now());

        // Not visible yet.
        assert!(q.lease(1, Duration::from_secs(30)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(40)).await;
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 1);
    }

    #[tokio::test]
    async fn backoff_is_clamped_to_the_ceiling() {
        let q = queue();
        let seq = q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        let disposition = q
            .fail(seq, &leased[0].lease_token, "slow", Duration::from_secs(3600))
            .await
            .unwrap();
        let Disposition::Requeued { visible_at, .. } = disposition else {
            panic!("expected requeue");
        };
        let delay = visible_at - Utc::now();
        assert!(delay <= chrono::Duration::seconds(61), "delay {delay} exceeds cap");
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_payload_preserved() {
        let q = queue_with(QueueSettings {
            max_attempts: 2,
            ..QueueSettings::default()
        });
        let seq = q.enqueue(b"doomed".to_vec(), 0, Some("k".to_string()), None).await.unwrap();

        for attempt in 1..=3u32 {
            let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
            assert_eq!(leased.len(), 1, "attempt {attempt} found no item");
            let disposition = q
                .fail(seq, &leased[0].lease_token, "boom", Duration::ZERO)
                .await
                .unwrap();
            if attempt == 3 {
                assert_eq!(disposition, Disposition::DeadLettered);
            } else {
                assert!(matches!(disposition, Disposition::Requeued { .. }));
            }
        }

        let dead = q.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].seq, seq);
        assert_eq!(dead[0].payload, b"doomed".to_vec());
        assert_eq!(dead[0].final_error.as_deref(), Some("boom"));
        assert_eq!(q.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn fail_with_stale_token_is_a_noop() {
        let q = queue();
        let seq = q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert!(q.complete(seq, &leased[0].lease_token).await.unwrap());
        let disposition = q
            .fail(seq, &leased[0].lease_token, "late", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::NotLeased);
    }

    #[tokio::test]
    async fn expired_leases_are_reaped_back_to_pending() {
        let q = queue();
        let seq = q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        let leased = q.lease(1, Duration::ZERO).await.unwrap();
        assert_eq!(leased.len(), 1);

        let reaped = q.reap_expired_leases().await.unwrap();
        assert_eq!(reaped, 1);
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.leased, 0);

        // The stale worker's disposition no longer applies.
        assert!(!q.complete(seq, &leased[0].lease_token).await.unwrap());
    }

    #[tokio::test]
    async fn unexpired_leases_survive_reaping() {
        let q = queue();
        q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        q.lease(1, Duration::from_secs(300)).await.unwrap();
        assert_eq!(q.reap_expired_leases().await.unwrap(), 0);
        assert_eq!(q.stats().await.unwrap().leased, 1);
    }

    #[tokio::test]
    async fn enqueue_refuses_above_soft_cap() {
        let q = queue_with(QueueSettings {
            soft_cap: 2,
            ..QueueSettings::default()
        });
        q.enqueue(b"1".to_vec(), 0, None, None).await.unwrap();
        q.enqueue(b"2".to_vec(), 0, None, None).await.unwrap();
        let err = q.enqueue(b"3".to_vec(), 0, None, None).await.unwrap_err();
        assert!(matches!(err, QueueError::Backpressure { pending: 2 }));
    }

    #[tokio::test]
    async fn delayed_visibility_holds_items_back() {
        let q = queue();
        q.enqueue(
            b"later".to_vec(),
            0,
            None,
            Some(Utc::now() + chrono::Duration::milliseconds(30)),
        )
        .await
        .unwrap();
        assert!(q.lease(1, Duration::from_secs(30)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(q.lease(1, Duration::from_secs(30)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_dead_reinstates_the_payload() {
        let q = queue_with(QueueSettings {
            max_attempts: 0,
            ..QueueSettings::default()
        });
        let seq = q.enqueue(b"x".to_vec(), 3, None, None).await.unwrap();
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(
            q.fail(seq, &leased[0].lease_token, "nope", Duration::ZERO).await.unwrap(),
            Disposition::DeadLettered
        );

        let new_seq = q.replay_dead(seq).await.unwrap();
        assert_ne!(new_seq, seq);
        assert!(q.list_dead(10).await.unwrap().is_empty());
        let leased = q.lease(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased[0].payload, b"x".to_vec());
        assert_eq!(leased[0].priority, 3);
        assert_eq!(leased[0].attempts, 0);

        assert!(matches!(
            q.replay_dead(999).await.unwrap_err(),
            QueueError::DeadItemNotFound(999)
        ));
    }

    #[tokio::test]
    async fn recover_on_startup_reaps_and_reports() {
        let q = queue();
        q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        q.lease(1, Duration::ZERO).await.unwrap();
        assert_eq!(q.recover_on_startup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_for_work_wakes_on_enqueue() {
        let q = queue();
        let waiter = q.clone();
        let start = std::time::Instant::now();
        let wait = tokio::spawn(async move {
            waiter.wait_for_work(Duration::from_secs(5)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(b"x".to_vec(), 0, None, None).await.unwrap();
        wait.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

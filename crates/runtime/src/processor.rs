//! The queue consumer: lease → privacy filter → commit/push → settle.
//!
//! This is the only place write-path failures turn into queue
//! dispositions. Per batch:
//!
//! 1. decode payloads, failing undecodable or path-invalid items
//!    individually and carrying on;
//! 2. hold back AI-requiring items while the budget is frozen (plain
//!    file commits are never token-gated);
//! 3. mask every body through the privacy filter and persist the
//!    resulting security events;
//! 4. drive the git commit protocol, then complete or fail the whole
//!    remainder together (a kept local commit rides along with the
//!    retry).

use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notevault_ai::TokenGovernor;
use notevault_git::{CommitFile, GitError, GitOperator};
use notevault_queue::{LeasedItem, Queue, backoff_for_attempt};
use notevault_security::{PrivacyFilter, SecurityEvent, validate_path};
use notevault_store::Store;

use crate::artifact::FileArtifact;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub lease_duration: Duration,
    /// Idle sleep ceiling; shrinks as the queue deepens.
    pub batch_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease_duration: Duration::from_secs(60),
            batch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items held back because they need AI and the budget is frozen.
    pub held: usize,
    pub masked: usize,
    pub commit_created: bool,
}

pub struct BatchProcessor {
    queue: Queue,
    git: Arc<GitOperator>,
    privacy: Arc<PrivacyFilter>,
    store: Store,
    governor: Arc<TokenGovernor>,
    /// Provider whose budget gates AI-requiring items.
    ai_provider: String,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        queue: Queue,
        git: Arc<GitOperator>,
        privacy: Arc<PrivacyFilter>,
        store: Store,
        governor: Arc<TokenGovernor>,
        ai_provider: impl Into<String>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            queue,
            git,
            privacy,
            store,
            governor,
            ai_provider: ai_provider.into(),
            settings,
        }
    }

    /// Worker loop: drain, then sleep inversely to queue depth until
    /// woken by an enqueue or told to stop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let report = match self.process_once().await {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %err, "batch cycle failed");
                    BatchReport::default()
                }
            };

            if report.leased == 0 {
                let idle = self.idle_sleep().await;
                tokio::select! {
                    _ = self.queue.wait_for_work(idle) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Sleep budget shrinks as the backlog grows, down to zero.
    async fn idle_sleep(&self) -> Duration {
        let pending = self
            .queue
            .stats()
            .await
            .map(|stats| stats.pending)
            .unwrap_or(0);
        if pending == 0 {
            self.settings.batch_timeout
        } else {
            let divisor = 1 + pending / self.settings.batch_size.max(1);
            self.settings.batch_timeout / divisor as u32
        }
    }

    /// One lease-process-settle cycle.
    pub async fn process_once(&self) -> Result<BatchReport, notevault_queue::QueueError> {
        let leased = self
            .queue
            .lease(self.settings.batch_size, self.settings.lease_duration)
            .await?;
        let mut report = BatchReport {
            leased: leased.len(),
            ..BatchReport::default()
        };
        if leased.is_empty() {
            return Ok(report);
        }

        let batch_id = Uuid::new_v4().to_string();
        let frozen = !self.governor.check_limits(&self.ai_provider).allowed;

        // Per-item validation first; bad items must not poison the
        // batch.
        let mut commit_files = Vec::new();
        let mut commit_items: Vec<LeasedItem> = Vec::new();
        for item in leased {
            let artifact = match FileArtifact::decode(&item.payload) {
                Ok(artifact) => artifact,
                Err(err) => {
                    report.failed += 1;
                    self.queue
                        .fail(
                            item.seq,
                            &item.lease_token,
                            &format!("undecodable payload: {err}"),
                            backoff_for_attempt(item.attempts + 1),
                        )
                        .await?;
                    continue;
                }
            };

            if artifact.requires_ai && frozen {
                report.held += 1;
                self.queue
                    .fail(
                        item.seq,
                        &item.lease_token,
                        "deferred: monthly token ceiling reached",
                        notevault_queue::MAX_BACKOFF,
                    )
                    .await?;
                continue;
            }

            if let Err(err) = validate_path(self.git.work_dir(), &artifact.path) {
                report.failed += 1;
                self.queue
                    .fail(
                        item.seq,
                        &item.lease_token,
                        &format!("invalid artifact path: {err}"),
                        backoff_for_attempt(item.attempts + 1),
                    )
                    .await?;
                continue;
            }

            let outcome = self
                .privacy
                .mask_chunked(&artifact.body, self.privacy.default_level())
                .await;
            if outcome.was_masked() {
                report.masked += 1;
                let origin = artifact
                    .origin_ref
                    .as_deref()
                    .or(artifact.note_id.as_deref())
                    .unwrap_or("unknown");
                let events = self.privacy.log_events(&outcome.applied, origin);
                self.persist_security_events(&events).await;
            }

            commit_files.push(CommitFile {
                path: artifact.path,
                body: outcome.text,
            });
            commit_items.push(item);
        }

        if commit_items.is_empty() {
            return Ok(report);
        }

        match self.git.commit_batch(&commit_files, &batch_id).await {
            Ok(outcome) => {
                report.commit_created = outcome.created_commit;
                for item in &commit_items {
                    if self.queue.complete(item.seq, &item.lease_token).await? {
                        report.completed += 1;
                    }
                }
                info!(
                    batch_id,
                    files = commit_files.len(),
                    commit = %outcome.commit_id,
                    "batch pushed"
                );
            }
            Err(err) => {
                // Commit-then-push-failure keeps the local commit; the
                // retry fast-forward-pushes it alongside new work.
                let transient = err.is_transient();
                warn!(batch_id, transient, error = %err, "batch commit failed, requeueing");
                for item in &commit_items {
                    report.failed += 1;
                    self.queue
                        .fail(
                            item.seq,
                            &item.lease_token,
                            &sanitize_git_error(&err),
                            backoff_for_attempt(item.attempts + 1),
                        )
                        .await?;
                }
            }
        }
        Ok(report)
    }

    async fn persist_security_events(&self, events: &[SecurityEvent]) {
        let rows: Vec<(String, String, String, String, usize, String, bool)> = events
            .iter()
            .map(|event| {
                (
                    event.event_id.to_string(),
                    event.rule_id.clone(),
                    format!("{:?}", event.privacy_level).to_lowercase(),
                    event.origin_digest.clone(),
                    event.match_count,
                    event.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    event.alerted,
                )
            })
            .collect();
        let result = self
            .store
            .with_conn(move |conn| {
                for row in &rows {
                    conn.execute(
                        "INSERT OR IGNORE INTO security_events
                           (event_id, rule_id, privacy_level, origin_digest,
                            match_count, occurred_at, alerted)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        notevault_store::rusqlite::params![
                            row.0, row.1, row.2, row.3, row.4 as i64, row.5, row.6,
                        ],
                    )?;
                }
                Ok(())
            })
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to persist security events");
        } else {
            debug!(count = events.len(), "security events recorded");
        }
    }
}

/// Queue rows are operator-visible; keep git detail but never raw
/// stderr that could carry URLs.
fn sanitize_git_error(err: &GitError) -> String {
    match err {
        GitError::Transient(_) => "git push/commit failed (transient)".to_string(),
        GitError::Timeout(timeout) => format!("git operation timed out after {timeout:?}"),
        GitError::Permanent(_) => "git push/commit failed (permanent)".to_string(),
        GitError::Validation(inner) => format!("artifact rejected: {inner}"),
        GitError::Io(_) => "git workspace io failure".to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

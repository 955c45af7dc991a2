//! Ordered, checksummed schema migrations.
//!
//! Each migration runs once, inside its own transaction, gated by the
//! `schema_migrations` table. The SHA-256 of every applied migration's
//! SQL is stored and re-verified at startup; a mismatch means the
//! binary and the database disagree about history and is fatal unless
//! the operator passes the explicit override.

use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::StoreError;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "notes_and_links",
        sql: r#"
CREATE TABLE notes (
  note_id          TEXT PRIMARY KEY,
  title            TEXT NOT NULL,
  title_norm       TEXT NOT NULL,
  body             TEXT NOT NULL,
  tags             TEXT NOT NULL DEFAULT '[]',
  source_type      TEXT NOT NULL,
  origin_ref       TEXT,
  actor_id         TEXT,
  channel_id       TEXT,
  created_at       TEXT NOT NULL,
  updated_at       TEXT NOT NULL,
  vector_synced_at TEXT,
  content_hash     TEXT NOT NULL,
  deleted_at       TEXT
);
CREATE INDEX idx_notes_title_norm ON notes(title_norm);
CREATE INDEX idx_notes_updated_at ON notes(updated_at);

CREATE TABLE links (
  from_note_id  TEXT NOT NULL,
  to_note_id    TEXT,
  to_title_norm TEXT NOT NULL,
  kind          TEXT NOT NULL,
  created_at    TEXT NOT NULL,
  UNIQUE(from_note_id, to_title_norm, kind)
);
CREATE INDEX idx_links_to_note ON links(to_note_id);
CREATE INDEX idx_links_pending ON links(to_title_norm) WHERE to_note_id IS NULL;
"#,
    },
    Migration {
        version: 2,
        name: "queue",
        sql: r#"
CREATE TABLE queue_items (
  seq              INTEGER PRIMARY KEY AUTOINCREMENT,
  enqueued_at      TEXT NOT NULL,
  visible_at       TEXT NOT NULL,
  priority         INTEGER NOT NULL DEFAULT 0,
  attempts         INTEGER NOT NULL DEFAULT 0,
  status           TEXT NOT NULL DEFAULT 'pending',
  idempotency_key  TEXT,
  payload          BLOB NOT NULL,
  last_error       TEXT,
  lease_token      TEXT,
  lease_expires_at TEXT
);
CREATE UNIQUE INDEX idx_queue_idempotency
  ON queue_items(idempotency_key)
  WHERE idempotency_key IS NOT NULL AND status IN ('pending', 'leased');
CREATE INDEX idx_queue_leasable
  ON queue_items(status, visible_at, priority, seq);

CREATE TABLE dead_items (
  seq             INTEGER PRIMARY KEY,
  enqueued_at     TEXT NOT NULL,
  priority        INTEGER NOT NULL,
  attempts        INTEGER NOT NULL,
  idempotency_key TEXT,
  payload         BLOB NOT NULL,
  final_error     TEXT,
  moved_at        TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 3,
        name: "usage_and_security_events",
        sql: r#"
CREATE TABLE usage_records (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  provider       TEXT NOT NULL,
  model          TEXT NOT NULL,
  input_tokens   INTEGER NOT NULL,
  output_tokens  INTEGER NOT NULL,
  cost_micro_usd INTEGER NOT NULL,
  request_kind   TEXT NOT NULL,
  actor_id       TEXT,
  occurred_at    TEXT NOT NULL
);
CREATE INDEX idx_usage_occurred_at ON usage_records(provider, occurred_at);

CREATE TABLE security_events (
  event_id      TEXT PRIMARY KEY,
  rule_id       TEXT NOT NULL,
  privacy_level TEXT NOT NULL,
  origin_digest TEXT NOT NULL,
  match_count   INTEGER NOT NULL,
  occurred_at   TEXT NOT NULL,
  alerted       INTEGER NOT NULL
);
"#,
    },
];

fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub verified: usize,
}

/// Apply every pending migration in version order and verify the
/// checksums of those already applied.
pub fn apply_migrations(
    conn: &mut Connection,
    checksum_override: bool,
) -> Result<MigrationReport, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
           version    INTEGER PRIMARY KEY,
           name       TEXT NOT NULL,
           checksum   TEXT NOT NULL,
           applied_at TEXT NOT NULL
         );",
    )?;

    let mut report = MigrationReport::default();
    for migration in MIGRATIONS {
        let existing: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = ?1",
                [migration.version],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let expected = checksum(migration.sql);
        match existing {
            Some(stored) if stored == expected => {
                report.verified += 1;
            }
            Some(stored) => {
                if !checksum_override {
                    return Err(StoreError::Corrupt(format!(
                        "migration {} ({}) checksum mismatch: stored {} != computed {}",
                        migration.version,
                        migration.name,
                        &stored[..12.min(stored.len())],
                        &expected[..12],
                    )));
                }
                warn!(
                    version = migration.version,
                    name = migration.name,
                    "migration checksum mismatch accepted via override"
                );
                conn.execute(
                    "UPDATE schema_migrations SET checksum = ?1 WHERE version = ?2",
                    rusqlite::params![expected, migration.version],
                )?;
                report.verified += 1;
            }
            None => {
                let tx = conn.transaction()?;
                tx.execute_batch(migration.sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version, name, checksum, applied_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        migration.version,
                        migration.name,
                        expected,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                tx.commit()?;
                info!(version = migration.version, name = migration.name, "migration applied");
                report.applied.push(migration.version);
            }
        }
    }
    Ok(report)
}

/// Highest applied migration version, if any.
pub fn schema_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .or_else(|err| match err {
            rusqlite::Error::SqliteFailure(_, Some(ref msg)) if msg.contains("no such table") => {
                Ok(None)
            }
            other => Err(other),
        })?;
    Ok(version)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once_and_verify_after() {
        let mut conn = Connection::open_in_memory().unwrap();
        let first = apply_migrations(&mut conn, false).unwrap();
        assert_eq!(first.applied.len(), MIGRATIONS.len());
        assert_eq!(first.verified, 0);

        let second = apply_migrations(&mut conn, false).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.verified, MIGRATIONS.len());
        assert_eq!(schema_version(&conn).unwrap(), Some(MIGRATIONS.len() as i64));
    }

    #[test]
    fn checksum_mismatch_is_fatal_without_override() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, false).unwrap();
        conn.execute("UPDATE schema_migrations SET checksum = 'tampered' WHERE version = 1", [])
            .unwrap();

        let err = apply_migrations(&mut conn, false).unwrap_err();
        assert!(err.is_corrupt(), "expected Corrupt, got {err:?}");

        // Override repairs the stored checksum and proceeds.
        let report = apply_migrations(&mut conn, true).unwrap();
        assert_eq!(report.verified, MIGRATIONS.len());
        let report = apply_migrations(&mut conn, false).unwrap();
        assert_eq!(report.verified, MIGRATIONS.len());
    }

    #[test]
    fn versions_are_strictly_increasing_and_unique() {
        let mut last = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > last, "{} out of order", migration.version);
            last = migration.version;
        }
    }
}

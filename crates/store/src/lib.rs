//! Embedded relational store.
//!
//! A single-file SQLite database (WAL mode) behind one shared write
//! connection. Every statement runs on the blocking pool through
//! [`Store::with_conn`], which scopes connection access so the guard is
//! released on success, error, and panic alike. Schema history lives in
//! [`migrations`]; the full-text index over notes is managed here with
//! a deterministic substring-ranking fallback for builds where FTS5 is
//! unavailable.

pub mod error;
pub mod migrations;
mod search;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

pub use error::StoreError;
pub use migrations::{MigrationReport, apply_migrations, schema_version};
pub use rusqlite;
pub use search::SearchHit;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Accept migration checksum mismatches (operator override).
    pub checksum_override: bool,
    /// Attempt to build the FTS5 index. Disabled only in tests that
    /// exercise the substring fallback.
    pub enable_fts: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            checksum_override: false,
            enable_fts: true,
        }
    }
}

/// Handle to the relational store. Cheap to clone; all clones share
/// one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    fts_enabled: bool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("fts_enabled", &self.fts_enabled)
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) the database at `path`, apply pending
    /// migrations, and set up the full-text index.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, path, options)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"), options)
    }

    fn init(mut conn: Connection, path: PathBuf, options: StoreOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL gives concurrent readers alongside the single writer; the
        // in-memory test database reports `memory` here, which is fine.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;

        let report = apply_migrations(&mut conn, options.checksum_override)?;
        let fts_enabled = options.enable_fts && Self::setup_fts(&conn);

        info!(
            path = %path.display(),
            journal_mode,
            applied = report.applied.len(),
            verified = report.verified,
            fts = fts_enabled,
            "store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            fts_enabled,
        })
    }

    /// Create the external-content FTS5 table and its sync triggers.
    /// Returns false (and logs) when the engine lacks FTS5, flipping
    /// keyword search to the substring fallback.
    fn setup_fts(conn: &Connection) -> bool {
        let result = conn.execute_batch(
            r#"
CREATE VIRTUAL TABLE IF NOT EXISTS notes_fts
  USING fts5(title, body, tags, content='notes', content_rowid='rowid');

CREATE TRIGGER IF NOT EXISTS notes_fts_insert AFTER INSERT ON notes BEGIN
  INSERT INTO notes_fts(rowid, title, body, tags)
  VALUES (new.rowid, new.title, new.body, new.tags);
END;
CREATE TRIGGER IF NOT EXISTS notes_fts_delete AFTER DELETE ON notes BEGIN
  INSERT INTO notes_fts(notes_fts, rowid, title, body, tags)
  VALUES ('delete', old.rowid, old.title, old.body, old.tags);
END;
CREATE TRIGGER IF NOT EXISTS notes_fts_update AFTER UPDATE ON notes BEGIN
  INSERT INTO notes_fts(notes_fts, rowid, title, body, tags)
  VALUES ('delete', old.rowid, old.title, old.body, old.tags);
  INSERT INTO notes_fts(rowid, title, body, tags)
  VALUES (new.rowid, new.title, new.body, new.tags);
END;

INSERT INTO notes_fts(notes_fts) VALUES ('rebuild');
"#,
        );
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "FTS5 unavailable, using substring ranking fallback");
                false
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    /// Run `f` with exclusive access to the connection on the blocking
    /// pool. The connection guard cannot outlive the closure, so it is
    /// released on every exit path.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Corrupt("store connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Transient(format!("blocking task failed: {err}")))?
    }

    /// Synchronous variant of [`with_conn`] for startup paths that are
    /// not yet inside the runtime.
    pub fn with_conn_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Corrupt("store connection poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Execute a multi-statement script inside one transaction.
    pub async fn execute_tx(&self, sql: String) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&sql)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Ranked keyword search over note title, body, and tags.
    ///
    /// Only live (non-tombstoned) notes are returned. With FTS5 the
    /// ranking is BM25; the fallback ranks by token-overlap count,
    /// then recency, then `note_id` ascending, so either path is
    /// deterministic.
    pub async fn search_keyword(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let query = query.to_string();
        let fts = self.fts_enabled;
        debug!(k, fts, "keyword search");
        self.with_conn(move |conn| {
            if fts {
                search::search_fts(conn, &query, k)
            } else {
                search::search_fallback(conn, &query, k)
            }
        })
        .await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_note(store: &Store, id: &str, title: &str, body: &str, updated_at: &str) {
        store
            .with_conn_blocking(|conn| {
                conn.execute(
                    "INSERT INTO notes (note_id, title, title_norm, body, tags, source_type,
                                        created_at, updated_at, content_hash)
                     VALUES (?1, ?2, lower(?2), ?3, '[]', 'manual', ?4, ?4, 'h')",
                    rusqlite::params![id, title, body, updated_at],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn open_applies_migrations_and_reopens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            let version = store
                .with_conn_blocking(|conn| schema_version(conn))
                .unwrap();
            assert_eq!(version, Some(migrations::MIGRATIONS.len() as i64));
        }
        // Second open verifies checksums instead of re-applying.
        Store::open(&path, StoreOptions::default()).unwrap();
    }

    #[test]
    fn wal_mode_is_active_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db"), StoreOptions::default()).unwrap();
        let mode: String = store
            .with_conn_blocking(|conn| {
                Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn with_conn_releases_on_error() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let failed: Result<(), _> = store
            .with_conn(|_conn| Err(StoreError::Transient("boom".to_string())))
            .await;
        assert!(failed.is_err());
        // Connection must still be usable afterwards.
        let one: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn execute_tx_rolls_back_atomically() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let bad = store
            .execute_tx(
                "INSERT INTO notes (note_id, title, title_norm, body, source_type,
                                    created_at, updated_at, content_hash)
                 VALUES ('n1', 't', 't', 'b', 'manual', '2026-01-01', '2026-01-01', 'h');
                 INSERT INTO nonexistent VALUES (1);"
                    .to_string(),
            )
            .await;
        assert!(bad.is_err());
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0, "failed script must not leave partial writes");
    }

    #[tokio::test]
    async fn keyword_search_finds_and_ranks_notes() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        insert_note(&store, "n1", "Alpha", "alpha alpha beta", "2026-01-02T00:00:00Z");
        insert_note(&store, "n2", "Beta", "unrelated text", "2026-01-03T00:00:00Z");
        insert_note(&store, "n3", "Gamma", "alpha mention", "2026-01-01T00:00:00Z");

        let hits = store.search_keyword("alpha", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.note_id.as_str()).collect();
        assert!(ids.contains(&"n1"));
        assert!(ids.contains(&"n3"));
        assert!(!ids.contains(&"n2"));
    }

    #[tokio::test]
    async fn tombstoned_notes_never_surface_in_search() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        insert_note(&store, "n1", "Secret", "alpha body", "2026-01-01T00:00:00Z");
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE notes SET deleted_at = '2026-01-02T00:00:00Z' WHERE note_id = 'n1'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let hits = store.search_keyword("alpha", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn fallback_ranking_is_deterministic() {
        let store = Store::open_in_memory(StoreOptions {
            enable_fts: false,
            ..StoreOptions::default()
        })
        .unwrap();
        assert!(!store.fts_enabled());

        // Same overlap and same timestamp: order must come from note_id.
        insert_note(&store, "b", "alpha", "one", "2026-01-01T00:00:00Z");
        insert_note(&store, "a", "alpha", "two", "2026-01-01T00:00:00Z");
        // Higher overlap wins over recency.
        insert_note(&store, "c", "alpha beta", "alpha beta", "2025-01-01T00:00:00Z");

        let hits = store.search_keyword("alpha beta", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.note_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}

//! Store error taxonomy.
//!
//! Callers only need one distinction: `Transient` failures are worth a
//! retry, `Corrupt` failures mean the on-disk state can no longer be
//! trusted and the process should halt rather than write more.

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StoreError::Corrupt(err.to_string())
                }
                _ => StoreError::Transient(err.to_string()),
            },
            // Programming errors (bad SQL, type mismatches) leave the
            // database itself intact.
            _ => StoreError::Transient(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Transient(err.to_string())
    }
}

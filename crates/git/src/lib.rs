//! Git mirroring: per-instance working trees and credential supply.
//!
//! [`operator`] owns one working directory per process instance and
//! performs clone/fetch/commit/push against the configured remote.
//! [`auth`] supplies the credentials those network operations embed.
//!
//! Every git invocation uses argument arrays (never a shell string)
//! and carries a per-operation timeout.

pub mod auth;
pub mod operator;

pub use auth::{AuthProvider, Credential, InstallationAuthProvider, RateLimitState, StaticTokenProvider};
pub use operator::{CommitFile, CommitOutcome, GitOperator, GitWorkspace};

use std::time::Duration;

use notevault_security::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Network trouble, lock contention, non-fast-forward: retryable.
    #[error("transient git failure: {0}")]
    Transient(String),
    /// Auth, permissions, bad refs: retrying will not help.
    #[error("permanent git failure: {0}")]
    Permanent(String),
    #[error("git operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether the batch processor should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::Transient(_) | GitError::Timeout(_) | GitError::Io(_))
    }
}

//! The knowledge base: notes, the link graph, hybrid retrieval, and
//! relational↔vector consistency.
//!
//! ```text
//! KnowledgeManager ──▶ Store (truth: metadata + body + links)
//!        │ bump epoch / wake
//!        ▼
//! SyncCoordinator ──▶ EmbeddingAdapter ──▶ VectorStore (derived index)
//!        ▲
//! HybridSearch ──▶ Store.FTS + VectorStore, fused by RRF
//! ```
//!
//! A note write is acknowledged once the relational commit lands; the
//! vector upsert follows asynchronously, so a fresh note is always
//! reachable through full-text search even before its embedding
//! exists.

pub mod manager;
pub mod note;
pub mod search;
pub mod sync;

use notevault_ai::AiError;
use notevault_security::{PrivacyError, ValidationError};
use notevault_store::StoreError;
use notevault_vector::VectorError;

pub use manager::{KnowledgeManager, MergeOutcome, NewNote, NotePatch, TagSuggestions};
pub use note::{
    Link, LinkKind, Note, SourceType, embed_text, extract_links, extract_tags, normalize_title,
};
pub use search::{HybridSearch, SearchHit, SearchMode, rrf_fuse};
pub use sync::{ReconcileReport, SyncCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("note {0} not found")]
    NoteNotFound(String),
    #[error("merge requires at least two notes")]
    MergeTooFew,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Privacy(#[from] PrivacyError),
}

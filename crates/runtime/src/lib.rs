//! Runtime wiring: the write pipeline's consumer side, inbound event
//! dispatch, and component construction.
//!
//! ```text
//! chat event ─▶ EventHandler ─▶ KnowledgeManager ─▶ Queue (artifact)
//!                                                      │
//!                              BatchProcessor ◀─ lease ┘
//!                                │ privacy mask + security events
//!                                ▼
//!                              GitOperator ─▶ remote vault
//! ```
//!
//! Everything is built once in [`bootstrap::build`] and passed by
//! `Arc`; there is no runtime service lookup.

pub mod artifact;
pub mod bootstrap;
pub mod events;
pub mod processor;

pub use artifact::{FileArtifact, note_artifact};
pub use bootstrap::{App, BuildError, Core, build, build_core, run};
pub use events::{Ack, AckStatus, Event, EventHandler};
pub use processor::{BatchProcessor, BatchReport, BatchSettings};

//! Neutral inbound events and their dispatch.
//!
//! The chat platform adapter translates whatever its SDK delivers into
//! the [`Event`] sum type; everything below this line is
//! platform-agnostic. Acknowledgements carry short, non-leaking
//! messages — detail goes to the logs under the event id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use notevault_ai::{AiError, TranscriptionAdapter};
use notevault_knowledge::{KnowledgeError, KnowledgeManager, NewNote, SearchMode, SourceType};
use notevault_queue::{Queue, QueueError};
use notevault_security::ValidationError;

use crate::artifact::note_artifact;

#[derive(Debug, Clone)]
pub enum Event {
    TextMessage {
        event_id: String,
        actor_id: String,
        channel_id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    VoiceMessage {
        event_id: String,
        actor_id: String,
        channel_id: String,
        audio: Vec<u8>,
        mime: String,
        timestamp: DateTime<Utc>,
    },
    Command {
        event_id: String,
        actor_id: String,
        channel_id: String,
        name: String,
        args: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Self::TextMessage { event_id, .. }
            | Self::VoiceMessage { event_id, .. }
            | Self::Command { event_id, .. } => event_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Saved,
    /// Persisted, but outbound processing is backed up.
    Delayed,
    Rejected,
    Error,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub status: AckStatus,
    pub note_id: Option<String>,
    pub message: String,
}

impl Ack {
    fn saved(note_id: String, message: &str) -> Self {
        Self {
            status: AckStatus::Saved,
            note_id: Some(note_id),
            message: message.to_string(),
        }
    }

    fn rejected(message: &str) -> Self {
        Self {
            status: AckStatus::Rejected,
            note_id: None,
            message: message.to_string(),
        }
    }

    fn error() -> Self {
        Self {
            status: AckStatus::Error,
            note_id: None,
            message: "something went wrong, please try again".to_string(),
        }
    }
}

pub struct EventHandler {
    manager: Arc<KnowledgeManager>,
    transcriber: Arc<TranscriptionAdapter>,
    queue: Queue,
}

impl EventHandler {
    pub fn new(
        manager: Arc<KnowledgeManager>,
        transcriber: Arc<TranscriptionAdapter>,
        queue: Queue,
    ) -> Self {
        Self {
            manager,
            transcriber,
            queue,
        }
    }

    /// Entry point for every inbound chat event.
    pub async fn on_event(&self, event: Event) -> Ack {
        let event_id = event.event_id().to_string();
        let ack = match event {
            Event::TextMessage {
                event_id,
                actor_id,
                channel_id,
                content,
                ..
            } => {
                self.capture_note(&event_id, &actor_id, &channel_id, content, SourceType::Fleeting)
                    .await
            }
            Event::VoiceMessage {
                event_id,
                actor_id,
                channel_id,
                audio,
                mime,
                ..
            } => self.capture_voice(&event_id, &actor_id, &channel_id, &audio, &mime).await,
            Event::Command {
                event_id,
                actor_id,
                channel_id,
                name,
                args,
                ..
            } => self.dispatch_command(&event_id, &actor_id, &channel_id, &name, args).await,
        };

        match ack {
            Ok(ack) => ack,
            Err(err) => {
                warn!(event_id, error = %err, "event handling failed");
                match err {
                    HandlerError::Knowledge(KnowledgeError::Validation(_))
                    | HandlerError::Validation(_) => {
                        Ack::rejected("that input can't be saved as a note")
                    }
                    HandlerError::Knowledge(KnowledgeError::Privacy(_)) => {
                        Ack::rejected("content blocked by privacy policy")
                    }
                    HandlerError::Queue(QueueError::Backpressure { .. }) => Ack {
                        status: AckStatus::Delayed,
                        note_id: None,
                        message: "note queued, processing delayed — try again later".to_string(),
                    },
                    HandlerError::Ai(AiError::CeilingReached { .. }) => {
                        Ack::rejected("quota reached, try again next month")
                    }
                    HandlerError::Ai(AiError::Validation(_)) => {
                        Ack::rejected("that attachment can't be processed")
                    }
                    _ => Ack::error(),
                }
            }
        }
    }

    async fn capture_note(
        &self,
        event_id: &str,
        actor_id: &str,
        channel_id: &str,
        content: String,
        source_type: SourceType,
    ) -> Result<Ack, HandlerError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let title = derive_title(&content);
        let note_id = self
            .manager
            .create_note(NewNote {
                title,
                body: content,
                tags: None,
                source_type: Some(source_type),
                origin_ref: Some(event_id.to_string()),
                actor_id: Some(actor_id.to_string()),
                channel_id: Some(channel_id.to_string()),
            })
            .await?;

        // Tag suggestion is best-effort and never blocks the save.
        match self.manager.suggest_tags_for(&note_id).await {
            Ok(applied) if applied > 0 => info!(note_id, applied, "auto tags applied"),
            Ok(_) => {}
            Err(err) => warn!(note_id, error = %err, "tag suggestion failed"),
        }

        self.enqueue_outbound(&note_id, event_id).await?;
        info!(event_id, note_id, "note captured");
        Ok(Ack::saved(note_id, "note saved"))
    }

    async fn capture_voice(
        &self,
        event_id: &str,
        actor_id: &str,
        channel_id: &str,
        audio: &[u8],
        mime: &str,
    ) -> Result<Ack, HandlerError> {
        let transcript = self.transcriber.transcribe(audio, mime).await?;
        let ack = self
            .capture_note(
                event_id,
                actor_id,
                channel_id,
                transcript.text,
                SourceType::Voice,
            )
            .await?;
        if transcript.degraded {
            return Ok(Ack {
                message: "note saved (transcription deferred: quota reached)".to_string(),
                ..ack
            });
        }
        Ok(ack)
    }

    async fn dispatch_command(
        &self,
        event_id: &str,
        actor_id: &str,
        channel_id: &str,
        name: &str,
        args: Vec<String>,
    ) -> Result<Ack, HandlerError> {
        match name {
            "note" => {
                self.capture_note(
                    event_id,
                    actor_id,
                    channel_id,
                    args.join(" "),
                    SourceType::Manual,
                )
                .await
            }
            "search" => {
                let query = args.join(" ");
                let hits = self
                    .manager
                    .search_engine()
                    .search(&query, 5, SearchMode::Hybrid)
                    .await?;
                let mut lines = Vec::new();
                for hit in &hits {
                    if let Ok(note) = self.manager.get_note(&hit.note_id).await {
                        lines.push(format!("• {}", note.title));
                    }
                }
                let message = if lines.is_empty() {
                    "no matching notes".to_string()
                } else {
                    lines.join("\n")
                };
                Ok(Ack {
                    status: AckStatus::Saved,
                    note_id: None,
                    message,
                })
            }
            "delete" => {
                let note_id = args.first().cloned().unwrap_or_default();
                self.manager.delete_note(&note_id).await?;
                Ok(Ack {
                    status: AckStatus::Saved,
                    note_id: Some(note_id),
                    message: "note deleted".to_string(),
                })
            }
            "merge" => {
                let outcome = self.manager.merge_notes(&args, None).await?;
                self.enqueue_outbound(&outcome.note_id, event_id).await?;
                let message = if outcome.degraded {
                    "notes merged (plain concatenation: quota reached)"
                } else {
                    "notes merged"
                };
                Ok(Ack::saved(outcome.note_id, message))
            }
            "related" => {
                let note_id = args.first().cloned().unwrap_or_default();
                let hits = self.manager.find_related(&note_id, 5).await?;
                let mut lines = Vec::new();
                for hit in &hits {
                    if let Ok(note) = self.manager.get_note(&hit.note_id).await {
                        lines.push(format!("• {}", note.title));
                    }
                }
                let message = if lines.is_empty() {
                    "no related notes".to_string()
                } else {
                    lines.join("\n")
                };
                Ok(Ack {
                    status: AckStatus::Saved,
                    note_id: Some(note_id),
                    message,
                })
            }
            _ => Ok(Ack::rejected("unknown command")),
        }
    }

    /// Render the note and enqueue it for the git pipeline, keyed by
    /// the originating event so redelivered chat events stay
    /// idempotent.
    async fn enqueue_outbound(&self, note_id: &str, event_id: &str) -> Result<(), HandlerError> {
        let note = self.manager.get_note(note_id).await?;
        let artifact = note_artifact(&note);
        self.queue
            .enqueue(
                artifact.encode(),
                0,
                Some(format!("evt:{event_id}:{}", note.content_hash)),
                None,
            )
            .await?;
        Ok(())
    }
}

/// First non-empty line, bounded, as the note title.
fn derive_title(content: &str) -> String {
    let line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("note");
    let line = line.trim().trim_start_matches('#').trim();
    let mut title: String = line.chars().take(60).collect();
    if title.is_empty() {
        title = "Fleeting note".to_string();
    }
    title
}

#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

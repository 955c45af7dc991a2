//! Note CRUD, the link graph, merge, and tag suggestion.
//!
//! The manager is the only writer of notes and links. Writes are
//! serialized per note (a short-lived async lock held for the
//! relational write), acknowledged as soon as the relational commit
//! lands, and followed by a search-epoch bump plus a wake for the
//! sync coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notevault_ai::chat::TextBackend;
use notevault_ai::embedding::{content_hash, normalize};
use notevault_ai::{FallbackManager, RequestClass};
use notevault_security::{ContentScan, ValidationError, validate::scan_content};
use notevault_store::{Store, rusqlite};

use crate::note::{
    Link, LinkKind, Note, SourceType, embed_text, extract_links, merge_tags, normalize_title,
};
use crate::search::{HybridSearch, SearchMode};
use crate::{KnowledgeError, SearchHit};

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn row_to_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let tags_json: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let source: String = row.get("source_type")?;
    Ok(Note {
        note_id: row.get("note_id")?,
        title: row.get("title")?,
        body: row.get("body")?,
        tags,
        source_type: SourceType::parse(&source).unwrap_or(SourceType::Manual),
        origin_ref: row.get("origin_ref")?,
        actor_id: row.get("actor_id")?,
        channel_id: row.get("channel_id")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
        vector_synced_at: row
            .get::<_, Option<String>>("vector_synced_at")?
            .map(|raw| parse_ts(&raw)),
        content_hash: row.get("content_hash")?,
    })
}

const NOTE_COLUMNS: &str = "note_id, title, body, tags, source_type, origin_ref, actor_id, \
                            channel_id, created_at, updated_at, vector_synced_at, content_hash";

#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub title: String,
    pub body: String,
    pub tags: Option<Vec<String>>,
    pub source_type: Option<SourceType>,
    pub origin_ref: Option<String>,
    pub actor_id: Option<String>,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NotePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<Vec<String>>,
    pub source_type: Option<SourceType>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub note_id: String,
    /// True when the body is the deterministic concatenation because
    /// the budget was frozen.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSuggestions {
    /// Confidence ≥ 0.8: applied automatically by callers.
    pub auto_apply: Vec<(String, f32)>,
    /// Confidence in [0.6, 0.8): surfaced to the user.
    pub suggested: Vec<(String, f32)>,
}

pub struct KnowledgeManager {
    store: Store,
    search: Arc<HybridSearch>,
    fallback: Arc<FallbackManager>,
    text_backend: Arc<dyn TextBackend>,
    chat_model: String,
    sync_wake: Arc<Notify>,
    note_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KnowledgeManager {
    pub fn new(
        store: Store,
        search: Arc<HybridSearch>,
        fallback: Arc<FallbackManager>,
        text_backend: Arc<dyn TextBackend>,
        chat_model: impl Into<String>,
        sync_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            search,
            fallback,
            text_backend,
            chat_model: chat_model.into(),
            sync_wake,
            note_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn search_engine(&self) -> &Arc<HybridSearch> {
        &self.search
    }

    fn lock_for(&self, note_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.note_locks.lock().expect("note lock map");
        Arc::clone(
            locks
                .entry(note_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn note_changed(&self) {
        self.search.bump_epoch();
        self.sync_wake.notify_one();
    }

    // ── Create ────────────────────────────────────────────────────────────────

    pub async fn create_note(&self, new: NewNote) -> Result<String, KnowledgeError> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if let ContentScan::Dangerous(patterns) = scan_content(&new.body) {
            // Advisory: markdown bodies may legitimately quote markup;
            // the privacy filter guards the outbound copy.
            warn!(patterns = ?patterns, "note body matched content scan patterns");
        }

        let note_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let tags = merge_tags(new.tags.as_deref(), &new.body);
        let links = extract_links(&new.body);
        let source_type = new.source_type.unwrap_or(SourceType::Fleeting);
        let hash = content_hash(&normalize(&embed_text(&title, &new.body)));

        let insert_id = note_id.clone();
        let insert_title = title.clone();
        let body = new.body.clone();
        let tags_json = serde_json::to_string(&tags).expect("tags serialize");
        let origin_ref = new.origin_ref.clone();
        let actor_id = new.actor_id.clone();
        let channel_id = new.channel_id.clone();

        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let title_norm = normalize_title(&insert_title);
                tx.execute(
                    "INSERT INTO notes
                       (note_id, title, title_norm, body, tags, source_type, origin_ref,
                        actor_id, channel_id, created_at, updated_at, content_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
                    rusqlite::params![
                        insert_id,
                        insert_title,
                        title_norm,
                        body,
                        tags_json,
                        source_type.as_str(),
                        origin_ref,
                        actor_id,
                        channel_id,
                        ts(now),
                        hash,
                    ],
                )?;

                insert_reference_links(&tx, &insert_id, &links, now)?;

                // Dangling links elsewhere that name this title now
                // resolve, without touching their owners' rows.
                let resolved = tx.execute(
                    "UPDATE links SET to_note_id = ?1
                     WHERE to_note_id IS NULL AND to_title_norm = ?2",
                    rusqlite::params![insert_id, title_norm],
                )?;
                if resolved > 0 {
                    debug!(resolved, title = %insert_title, "pending links resolved");
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(note_id = %note_id, source = source_type.as_str(), "note created");
        self.note_changed();
        Ok(note_id)
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    pub async fn get_note(&self, note_id: &str) -> Result<Note, KnowledgeError> {
        let id = note_id.to_string();
        let note = self
            .store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {NOTE_COLUMNS} FROM notes
                     WHERE note_id = ?1 AND deleted_at IS NULL"
                );
                let note = conn
                    .query_row(&sql, [&id], |row| row_to_note(row))
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(note)
            })
            .await?;
        note.ok_or_else(|| KnowledgeError::NoteNotFound(note_id.to_string()))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Note>, KnowledgeError> {
        let notes = self
            .store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {NOTE_COLUMNS} FROM notes WHERE deleted_at IS NULL
                     ORDER BY updated_at DESC, note_id ASC LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let notes = stmt
                    .query_map([limit as i64], |row| row_to_note(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(notes)
            })
            .await?;
        Ok(notes)
    }

    pub async fn links_from(&self, note_id: &str) -> Result<Vec<Link>, KnowledgeError> {
        self.query_links("from_note_id = ?1", note_id).await
    }

    /// Incoming resolved links (who references this note).
    pub async fn backlinks(&self, note_id: &str) -> Result<Vec<Link>, KnowledgeError> {
        self.query_links("to_note_id = ?1", note_id).await
    }

    async fn query_links(&self, filter: &str, param: &str) -> Result<Vec<Link>, KnowledgeError> {
        let sql = format!(
            "SELECT from_note_id, to_note_id, to_title_norm, kind FROM links
             WHERE {filter} ORDER BY from_note_id, to_title_norm, kind"
        );
        let param = param.to_string();
        let links = self
            .store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let links = stmt
                    .query_map([param], |row| {
                        let kind: String = row.get(3)?;
                        Ok(Link {
                            from_note_id: row.get(0)?,
                            to_note_id: row.get(1)?,
                            to_title_norm: row.get(2)?,
                            kind: LinkKind::parse(&kind).unwrap_or(LinkKind::Reference),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(links)
            })
            .await?;
        Ok(links)
    }

    // ── Update ────────────────────────────────────────────────────────────────

    pub async fn update_note(&self, note_id: &str, patch: NotePatch) -> Result<Note, KnowledgeError> {
        let lock = self.lock_for(note_id);
        let _guard = lock.lock().await;

        let existing = self.get_note(note_id).await?;
        let title = patch.title.unwrap_or_else(|| existing.title.clone());
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let body = patch.body.unwrap_or_else(|| existing.body.clone());
        let body_changed = body != existing.body;
        let title_changed = normalize_title(&title) != normalize_title(&existing.title);
        let source_type = patch.source_type.unwrap_or(existing.source_type);
        let tags = merge_tags(patch.tags.as_deref(), &body);
        let links = extract_links(&body);
        let now = Utc::now();
        let hash = content_hash(&normalize(&embed_text(&title, &body)));

        let id = note_id.to_string();
        let tags_json = serde_json::to_string(&tags).expect("tags serialize");
        let update_title = title.clone();
        let update_body = body.clone();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let title_norm = normalize_title(&update_title);
                tx.execute(
                    "UPDATE notes SET title = ?1, title_norm = ?2, body = ?3, tags = ?4,
                            source_type = ?5, updated_at = ?6, content_hash = ?7
                     WHERE note_id = ?8",
                    rusqlite::params![
                        update_title,
                        title_norm,
                        update_body,
                        tags_json,
                        source_type.as_str(),
                        ts(now),
                        hash,
                        id,
                    ],
                )?;

                if body_changed {
                    tx.execute(
                        "DELETE FROM links WHERE from_note_id = ?1 AND kind = 'reference'",
                        [&id],
                    )?;
                    insert_reference_links(&tx, &id, &links, now)?;
                }
                if title_changed {
                    tx.execute(
                        "UPDATE links SET to_note_id = ?1
                         WHERE to_note_id IS NULL AND to_title_norm = ?2",
                        rusqlite::params![id, title_norm],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!(note_id, body_changed, title_changed, "note updated");
        self.note_changed();
        self.get_note(note_id).await
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    /// Tombstone a note. Outgoing links are removed; incoming links
    /// revert to pending (kept for audit and later resurrection). The
    /// vector record is purged by the next reconciliation.
    pub async fn delete_note(&self, note_id: &str) -> Result<(), KnowledgeError> {
        let lock = self.lock_for(note_id);
        let _guard = lock.lock().await;

        self.get_note(note_id).await?;
        let id = note_id.to_string();
        let now = Utc::now();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE notes SET deleted_at = ?1 WHERE note_id = ?2",
                    rusqlite::params![ts(now), id],
                )?;
                tx.execute("DELETE FROM links WHERE from_note_id = ?1", [&id])?;
                tx.execute(
                    "UPDATE links SET to_note_id = NULL WHERE to_note_id = ?1",
                    [&id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(note_id, "note tombstoned");
        self.note_changed();
        Ok(())
    }

    // ── Merge ─────────────────────────────────────────────────────────────────

    /// Combine several notes into a new one. The body is provider
    /// synthesized when the budget allows, otherwise a deterministic
    /// concatenation. Inputs survive, tagged `merged`, and the new
    /// note records a `merged_from` edge to each.
    pub async fn merge_notes(
        &self,
        note_ids: &[String],
        new_title: Option<String>,
    ) -> Result<MergeOutcome, KnowledgeError> {
        if note_ids.len() < 2 {
            return Err(KnowledgeError::MergeTooFew);
        }
        let mut inputs = Vec::with_capacity(note_ids.len());
        for id in note_ids {
            inputs.push(self.get_note(id).await?);
        }
        let earliest = inputs
            .iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.note_id.cmp(&b.note_id)))
            .expect("at least two inputs");
        let title = new_title.unwrap_or_else(|| format!("Merged: {}", earliest.title));

        let mut ordered = inputs.clone();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.note_id.cmp(&b.note_id)));
        let concatenation = ordered
            .iter()
            .map(|note| format!("## {}\n\n{}", note.title, note.body))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Synthesize one coherent markdown note titled {title:?} from the source notes \
             below. Keep every fact, merge overlaps, and keep existing [[links]] intact.\n\n\
             {concatenation}"
        );
        let backend = Arc::clone(&self.text_backend);
        let governor = Arc::clone(self.fallback.governor());
        let model = self.chat_model.clone();
        let routed = self
            .fallback
            .execute(
                RequestClass::UserInitiated,
                move |provider| {
                    let backend = Arc::clone(&backend);
                    let governor = Arc::clone(&governor);
                    let model = model.clone();
                    let prompt = prompt.clone();
                    async move {
                        let response = backend.complete(&provider, &model, &prompt).await?;
                        governor
                            .record_usage(
                                &provider,
                                &model,
                                response.input_tokens,
                                response.output_tokens,
                                "merge",
                                None,
                            )
                            .await?;
                        Ok(response.text)
                    }
                },
                || concatenation.clone(),
            )
            .await?;
        let degraded = routed.is_degraded();

        let merged_id = self
            .create_note(NewNote {
                title,
                body: routed.value,
                tags: None,
                source_type: Some(SourceType::Merged),
                ..NewNote::default()
            })
            .await?;

        let edges: Vec<(String, String)> = inputs
            .iter()
            .map(|note| (note.note_id.clone(), normalize_title(&note.title)))
            .collect();
        let from_id = merged_id.clone();
        let now = Utc::now();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                for (to_id, to_norm) in &edges {
                    tx.execute(
                        "INSERT OR IGNORE INTO links
                           (from_note_id, to_note_id, to_title_norm, kind, created_at)
                         VALUES (?1, ?2, ?3, 'merged_from', ?4)",
                        rusqlite::params![from_id, to_id, to_norm, ts(now)],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        for note in &inputs {
            if !note.tags.iter().any(|t| t == "merged") {
                let mut tags = note.tags.clone();
                tags.push("merged".to_string());
                self.update_note(
                    &note.note_id,
                    NotePatch {
                        tags: Some(tags),
                        ..NotePatch::default()
                    },
                )
                .await?;
            }
        }

        info!(merged = %merged_id, inputs = inputs.len(), degraded, "notes merged");
        Ok(MergeOutcome {
            note_id: merged_id,
            degraded,
        })
    }

    // ── Tag suggestion ────────────────────────────────────────────────────────

    pub async fn suggest_tags(&self, content: &str) -> Result<TagSuggestions, KnowledgeError> {
        let prompt = format!(
            "Suggest up to 5 topical tags for this note as a JSON array of \
             {{\"tag\": string, \"confidence\": number}} objects, and nothing else.\n\n{content}"
        );
        let backend = Arc::clone(&self.text_backend);
        let governor = Arc::clone(self.fallback.governor());
        let model = self.chat_model.clone();
        let routed = self
            .fallback
            .execute(
                RequestClass::NonEssential,
                move |provider| {
                    let backend = Arc::clone(&backend);
                    let governor = Arc::clone(&governor);
                    let model = model.clone();
                    let prompt = prompt.clone();
                    async move {
                        let response = backend.complete(&provider, &model, &prompt).await?;
                        governor
                            .record_usage(
                                &provider,
                                &model,
                                response.input_tokens,
                                response.output_tokens,
                                "suggest_tags",
                                None,
                            )
                            .await?;
                        Ok(response.text)
                    }
                },
                || "[]".to_string(),
            )
            .await?;

        Ok(parse_tag_suggestions(&routed.value))
    }

    /// Suggest tags for an existing note and apply the
    /// high-confidence ones. Returns how many tags were added.
    pub async fn suggest_tags_for(&self, note_id: &str) -> Result<usize, KnowledgeError> {
        let note = self.get_note(note_id).await?;
        let suggestions = self.suggest_tags(&note.body).await?;
        let mut tags = note.tags.clone();
        let mut added = 0;
        for (tag, _) in &suggestions.auto_apply {
            if !tags.contains(tag) {
                tags.push(tag.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.update_note(
                note_id,
                NotePatch {
                    tags: Some(tags),
                    ..NotePatch::default()
                },
            )
            .await?;
        }
        Ok(added)
    }

    // ── Related ───────────────────────────────────────────────────────────────

    /// Hybrid search seeded with the note's body, excluding the note
    /// itself.
    pub async fn find_related(
        &self,
        note_id: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, KnowledgeError> {
        let note = self.get_note(note_id).await?;
        let hits = self
            .search
            .search(&note.body, k + 1, SearchMode::Hybrid)
            .await?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.note_id != note_id)
            .take(k)
            .collect())
    }
}

fn insert_reference_links(
    tx: &rusqlite::Transaction<'_>,
    from_id: &str,
    link_titles: &[String],
    now: DateTime<Utc>,
) -> Result<(), notevault_store::StoreError> {
    for link_title in link_titles {
        let to_norm = normalize_title(link_title);
        let to_id: Option<String> = tx
            .query_row(
                "SELECT note_id FROM notes
                 WHERE title_norm = ?1 AND deleted_at IS NULL AND note_id != ?2
                 ORDER BY created_at ASC, note_id ASC LIMIT 1",
                rusqlite::params![to_norm, from_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        tx.execute(
            "INSERT OR IGNORE INTO links
               (from_note_id, to_note_id, to_title_norm, kind, created_at)
             VALUES (?1, ?2, ?3, 'reference', ?4)",
            rusqlite::params![from_id, to_id, to_norm, ts(now)],
        )?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WireTag {
    tag: String,
    confidence: f32,
}

/// Parse the provider's tag JSON; malformed entries are dropped, a
/// malformed document yields no suggestions at all.
fn parse_tag_suggestions(raw: &str) -> TagSuggestions {
    let trimmed = raw.trim();
    let json = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return TagSuggestions::default(),
    };
    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(json) else {
        return TagSuggestions::default();
    };

    let mut suggestions = TagSuggestions::default();
    for value in values {
        let Ok(wire) = serde_json::from_value::<WireTag>(value) else {
            continue;
        };
        let tag = wire.tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if wire.confidence >= 0.8 {
            suggestions.auto_apply.push((tag, wire.confidence));
        } else if wire.confidence >= 0.6 {
            suggestions.suggested.push((tag, wire.confidence));
        }
    }
    suggestions
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Note domain model and the link/tag token grammar.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Fleeting,
    Voice,
    Manual,
    Merged,
    Permanent,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fleeting => "fleeting",
            Self::Voice => "voice",
            Self::Manual => "manual",
            Self::Merged => "merged",
            Self::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fleeting" => Some(Self::Fleeting),
            "voice" => Some(Self::Voice),
            "manual" => Some(Self::Manual),
            "merged" => Some(Self::Merged),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: String,
    pub title: String,
    pub body: String,
    /// Lowercased, sorted, deduplicated.
    pub tags: Vec<String>,
    pub source_type: SourceType,
    pub origin_ref: Option<String>,
    pub actor_id: Option<String>,
    pub channel_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Time of the last successful vector upsert; `None` or older
    /// than `updated_at` means the embedding index is behind.
    pub vector_synced_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

impl Note {
    pub fn vector_in_sync(&self) -> bool {
        self.vector_synced_at
            .map(|synced| synced >= self.updated_at)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Reference,
    MergedFrom,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::MergedFrom => "merged_from",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reference" => Some(Self::Reference),
            "merged_from" => Some(Self::MergedFrom),
            _ => None,
        }
    }
}

/// Directed edge in the link graph. `to_note_id` is `None` while the
/// target title has no matching note ("pending"); it resolves
/// automatically when such a note is created.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub from_note_id: String,
    pub to_note_id: Option<String>,
    pub to_title_norm: String,
    pub kind: LinkKind,
}

impl Link {
    pub fn is_pending(&self) -> bool {
        self.to_note_id.is_none()
    }
}

// ── Token grammar ─────────────────────────────────────────────────────────────

static LINK_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]\n]+)\]\]").expect("static regex"));
static TAG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)#([\w-]{1,64})").expect("static regex"));

/// Titles referenced by `[[title]]` tokens, in order of first
/// appearance, inner whitespace preserved, duplicates (after
/// normalization) removed.
pub fn extract_links(body: &str) -> Vec<String> {
    let mut seen = Vec::new();
    let mut titles = Vec::new();
    for capture in LINK_TOKEN.captures_iter(body) {
        let title = capture[1].to_string();
        let norm = normalize_title(&title);
        if !seen.contains(&norm) {
            seen.push(norm);
            titles.push(title);
        }
    }
    titles
}

/// `#tag` tokens (at a word start), lowercased and deduplicated.
pub fn extract_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for capture in TAG_TOKEN.captures_iter(body) {
        let tag = capture[1].to_lowercase();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Canonical form for title comparison: NFKC then lowercase.
pub fn normalize_title(title: &str) -> String {
    title.nfkc().collect::<String>().trim().to_lowercase()
}

/// The exact text that gets embedded for a note; `content_hash` is
/// computed over its normalized form, so the store and the vector
/// index agree on what "current" means.
pub fn embed_text(title: &str, body: &str) -> String {
    format!("{title}\n{body}")
}

/// Merge explicit tags with tags extracted from the body into the
/// stored form (lowercased, sorted, unique).
pub fn merge_tags(explicit: Option<&[String]>, body: &str) -> Vec<String> {
    let mut tags: Vec<String> = extract_tags(body);
    if let Some(extra) = explicit {
        for tag in extra {
            let tag = tag.to_lowercase();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags.sort();
    tags
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_tokens_preserve_inner_whitespace() {
        let links = extract_links("see [[Project Plan]] and [[  spaced  out  ]]");
        assert_eq!(links, vec!["Project Plan", "  spaced  out  "]);
    }

    #[test]
    fn link_tokens_never_span_lines_or_nest() {
        assert!(extract_links("[[broken\ntitle]]").is_empty());
        let links = extract_links("[[a]][[b]]");
        assert_eq!(links, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_links_dedupe_case_insensitively() {
        let links = extract_links("[[Alpha]] then [[alpha]] then [[ALPHA]]");
        assert_eq!(links, vec!["Alpha"]);
    }

    #[test]
    fn tags_match_at_word_start_only() {
        let tags = extract_tags("#hello world#notatag\n#Second-tag");
        assert_eq!(tags, vec!["hello", "second-tag"]);
    }

    #[test]
    fn tags_are_length_bounded() {
        let long = "a".repeat(64);
        let tags = extract_tags(&format!("#{long}"));
        assert_eq!(tags, vec![long.clone()]);
        // 65 chars: only the first 64 are captured.
        let over = format!("#{long}a");
        let tags = extract_tags(&over);
        assert_eq!(tags[0].len(), 64);
    }

    #[test]
    fn title_normalization_is_nfkc_and_caseless() {
        assert_eq!(normalize_title("Ｇａｍｍａ"), "gamma");
        assert_eq!(normalize_title("  Alpha "), "alpha");
        assert_eq!(normalize_title("ﬁle"), "file");
    }

    #[test]
    fn merge_tags_unions_explicit_and_extracted() {
        let explicit = vec!["Manual".to_string(), "hello".to_string()];
        let tags = merge_tags(Some(&explicit), "intro #hello #World");
        assert_eq!(tags, vec!["hello", "manual", "world"]);
    }

    #[test]
    fn vector_in_sync_tracks_updated_at() {
        let now = Utc::now();
        let mut note = Note {
            note_id: "n".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            tags: vec![],
            source_type: SourceType::Manual,
            origin_ref: None,
            actor_id: None,
            channel_id: None,
            created_at: now,
            updated_at: now,
            vector_synced_at: None,
            content_hash: "h".to_string(),
        };
        assert!(!note.vector_in_sync());
        note.vector_synced_at = Some(now);
        assert!(note.vector_in_sync());
        note.updated_at = now + chrono::Duration::seconds(1);
        assert!(!note.vector_in_sync());
    }
}

//! Queue payloads: the outbound file artifact.

use serde::{Deserialize, Serialize};

use notevault_knowledge::Note;
use notevault_security::validate_filename;

/// One file destined for the vault, serialized as the queue payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArtifact {
    /// Path relative to the working root, e.g. `notes/plan-1a2b3c4d.md`.
    pub path: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    /// Chat event reference for privacy-event correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_ref: Option<String>,
    /// Set when the item still needs a paid AI call before commit;
    /// such items are held back while the budget is frozen.
    #[serde(default)]
    pub requires_ai: bool,
}

impl FileArtifact {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("artifact serializes")
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Render a note as its vault file: YAML frontmatter plus the body.
/// The batch processor masks the whole artifact before it is written.
pub fn note_artifact(note: &Note) -> FileArtifact {
    let slug = title_slug(&note.title);
    let short_id: String = note.note_id.chars().take(8).collect();
    let filename = format!("{slug}-{short_id}.md");
    // Defensive re-check; the slug alphabet already satisfies it.
    let filename = validate_filename(&filename).unwrap_or_else(|_| format!("{short_id}.md"));

    let tags = note
        .tags
        .iter()
        .map(|tag| format!("\"{tag}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let body = format!(
        "---\nid: {id}\ntitle: {title:?}\ntags: [{tags}]\nsource: {source}\ncreated: {created}\nupdated: {updated}\n---\n\n{body}\n",
        id = note.note_id,
        title = note.title,
        source = note.source_type.as_str(),
        created = note.created_at.to_rfc3339(),
        updated = note.updated_at.to_rfc3339(),
        body = note.body,
    );

    FileArtifact {
        path: format!("notes/{filename}"),
        body,
        note_id: Some(note.note_id.clone()),
        origin_ref: note.origin_ref.clone(),
        requires_ai: false,
    }
}

/// Lowercased ASCII slug of the title, bounded so the filename stays
/// well under the validator's byte limit.
fn title_slug(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "note".to_string() } else { slug }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use notevault_knowledge::SourceType;

    fn note(title: &str, body: &str) -> Note {
        let now = Utc::now();
        Note {
            note_id: "0123456789abcdef".to_string(),
            title: title.to_string(),
            body: body.to_string(),
            tags: vec!["a".to_string(), "b".to_string()],
            source_type: SourceType::Fleeting,
            origin_ref: Some("evt-1".to_string()),
            actor_id: None,
            channel_id: None,
            created_at: now,
            updated_at: now,
            vector_synced_at: None,
            content_hash: "h".to_string(),
        }
    }

    #[test]
    fn artifact_round_trips_through_the_queue_payload() {
        let artifact = note_artifact(&note("My Plan", "body text"));
        let decoded = FileArtifact::decode(&artifact.encode()).unwrap();
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn artifact_path_is_slugged_and_contains_the_id_prefix() {
        let artifact = note_artifact(&note("Weekly Plan: Q3 🚀", "x"));
        assert_eq!(artifact.path, "notes/weekly-plan-q3-01234567.md");
    }

    #[test]
    fn rendered_file_carries_frontmatter_and_body() {
        let artifact = note_artifact(&note("T", "the body"));
        assert!(artifact.body.starts_with("---\n"));
        assert!(artifact.body.contains("id: 0123456789abcdef"));
        assert!(artifact.body.contains("tags: [\"a\", \"b\"]"));
        assert!(artifact.body.contains("source: fleeting"));
        assert!(artifact.body.ends_with("the body\n"));
    }

    #[test]
    fn hostile_titles_still_produce_safe_filenames() {
        for title in ["../../etc/passwd", "CON", "", "🦀🦀🦀"] {
            let artifact = note_artifact(&note(title, "x"));
            assert!(artifact.path.starts_with("notes/"));
            assert!(!artifact.path.contains(".."));
        }
    }

    #[test]
    fn slug_is_length_bounded() {
        let artifact = note_artifact(&note(&"long word ".repeat(30), "x"));
        let filename = artifact.path.strip_prefix("notes/").unwrap();
        assert!(filename.len() <= 60);
    }
}

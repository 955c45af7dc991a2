//! Keyword search over notes: FTS5 when available, a deterministic
//! substring-ranking fallback otherwise.
//!
//! Only the ordering of hits is contractual; `score` is informational
//! and not comparable across the two code paths.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub note_id: String,
    pub score: f64,
}

pub(crate) fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(|token| token.to_lowercase())
        .collect()
}

pub(crate) fn search_fts(
    conn: &Connection,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>, StoreError> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    // Quote every token so user input cannot inject FTS5 query syntax.
    let match_expr = tokens
        .iter()
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" OR ");

    let mut stmt = conn.prepare(
        "SELECT notes.note_id, bm25(notes_fts) AS score
         FROM notes_fts
         JOIN notes ON notes.rowid = notes_fts.rowid
         WHERE notes_fts MATCH ?1 AND notes.deleted_at IS NULL
         ORDER BY score ASC, notes.updated_at DESC, notes.note_id ASC
         LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(rusqlite::params![match_expr, k as i64], |row| {
            Ok(SearchHit {
                note_id: row.get(0)?,
                score: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

/// Substring-ranking fallback: token-overlap count descending, then
/// `updated_at` descending, then `note_id` ascending.
pub(crate) fn search_fallback(
    conn: &Connection,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>, StoreError> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT note_id, title, body, tags, updated_at
         FROM notes WHERE deleted_at IS NULL",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut ranked: Vec<(usize, String, String)> = rows
        .into_iter()
        .filter_map(|(note_id, title, body, tags, updated_at)| {
            let note_tokens = tokenize(&format!("{title} {body} {tags}"));
            let overlap = query_tokens.intersection(&note_tokens).count();
            if overlap == 0 {
                None
            } else {
                Some((overlap, updated_at, note_id))
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    Ok(ranked
        .into_iter()
        .take(k)
        .map(|(overlap, _, note_id)| SearchHit {
            note_id,
            score: overlap as f64,
        })
        .collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

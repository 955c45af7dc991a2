//! Pure validators for filenames, paths, content, and frontmatter.
//!
//! All functions here are side-effect free (except `validate_path`,
//! which reads symlink metadata) and return owned, normalized values
//! so callers never re-use the raw input by accident.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Input rejected before it could do any harm.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("empty name")]
    EmptyName,
    #[error("name contains control characters")]
    ControlCharacters,
    #[error("reserved device name: {0}")]
    ReservedName(String),
    #[error("name is {0} bytes, limit is {MAX_FILENAME_BYTES}")]
    NameTooLong(usize),
    #[error("name contains a path separator or dot segment")]
    PathSegment,
    #[error("path is absolute")]
    AbsolutePath,
    #[error("path escapes its base directory")]
    OutsideBase,
    #[error("frontmatter key {0:?} is not a valid identifier")]
    BadKey(String),
    #[error("frontmatter value for {0:?} has an unsupported type")]
    UnsupportedType(String),
    #[error("frontmatter list for {0:?} exceeds {MAX_LIST_ITEMS} items")]
    ListTooLong(String),
    #[error("audio blob is {bytes} bytes, limit {limit}")]
    AudioTooLarge { bytes: u64, limit: u64 },
    #[error("io error during path resolution: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum filename length after UTF-8 encoding.
pub const MAX_FILENAME_BYTES: usize = 200;
const MAX_STRING_BYTES: usize = 1000;
const MAX_LIST_ITEMS: usize = 50;

/// Device names Windows reserves regardless of extension.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

// ── validate_filename ─────────────────────────────────────────────────────────

/// Check a bare filename (no directory part) and return it trimmed.
///
/// Rejects empty names, control characters, host-OS reserved device
/// names (with or without extension), names longer than
/// [`MAX_FILENAME_BYTES`] bytes of UTF-8, and anything containing a
/// path separator or dot segment.
pub fn validate_filename(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacters);
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(ValidationError::NameTooLong(name.len()));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ValidationError::PathSegment);
    }
    // "CON" and "CON.txt" are both reserved on Windows.
    let stem = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return Err(ValidationError::ReservedName(name.to_string()));
    }
    Ok(name.to_string())
}

// ── validate_path ─────────────────────────────────────────────────────────────

/// Resolve `rel` against `base` and prove the result stays inside
/// `base`, including through symlinks.
///
/// `base` must exist. The target itself need not exist yet (it is
/// usually about to be written), so the symlink check canonicalizes
/// the deepest existing ancestor of the joined path instead.
pub fn validate_path(base: &Path, rel: &str) -> Result<PathBuf, ValidationError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(ValidationError::AbsolutePath);
    }
    if rel.contains('\\') {
        return Err(ValidationError::PathSegment);
    }
    if rel.chars().any(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacters);
    }

    // Lexical normalization: `.` drops, `..` pops, popping past the
    // base is an escape.
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ValidationError::OutsideBase);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ValidationError::AbsolutePath);
            }
        }
    }
    if parts.is_empty() {
        return Err(ValidationError::EmptyName);
    }

    let base = base.canonicalize()?;
    let mut joined = base.clone();
    for part in &parts {
        joined.push(part);
    }

    // Symlink containment: canonicalize the deepest existing ancestor
    // and require it to still be under base.
    let mut probe = joined.clone();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => return Err(ValidationError::OutsideBase),
        }
    }
    let resolved = probe.canonicalize()?;
    if !resolved.starts_with(&base) {
        return Err(ValidationError::OutsideBase);
    }

    Ok(joined)
}

// ── scan_content ──────────────────────────────────────────────────────────────

/// Advisory verdict from [`scan_content`]. Callers decide whether a
/// dangerous body is rejected or sanitized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentScan {
    Clean,
    /// Names of the pattern classes that matched, deduplicated, in
    /// declaration order.
    Dangerous(Vec<String>),
}

static CONTENT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("script_tag", Regex::new(r"(?i)<\s*script\b").expect("static regex")),
        ("event_handler", Regex::new(r#"(?i)\bon[a-z]+\s*="#).expect("static regex")),
        ("javascript_url", Regex::new(r"(?i)javascript\s*:").expect("static regex")),
        ("data_url", Regex::new(r"(?i)data\s*:[^,\s]{0,64};base64").expect("static regex")),
        (
            "sql_fragment",
            Regex::new(r"(?i)(\bunion\s+select\b|;\s*drop\s+table\b|'\s*or\s+'?1'?\s*=\s*'?1)")
                .expect("static regex"),
        ),
    ]
});

/// Scan text for markup and injection fragments.
pub fn scan_content(text: &str) -> ContentScan {
    let hits: Vec<String> = CONTENT_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(text))
        .map(|(name, _)| (*name).to_string())
        .collect();
    if hits.is_empty() {
        ContentScan::Clean
    } else {
        ContentScan::Dangerous(hits)
    }
}

// ── validate_frontmatter ──────────────────────────────────────────────────────

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex"));

/// Normalize a frontmatter map: identifier keys only, strings
/// HTML-escaped and truncated, lists capped, scalar types passed
/// through, everything else rejected.
pub fn validate_frontmatter(map: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
    let mut normalized = Map::new();
    for (key, value) in map {
        if !KEY_PATTERN.is_match(key) {
            return Err(ValidationError::BadKey(key.clone()));
        }
        let clean = match value {
            Value::String(s) => Value::String(escape_and_truncate(s)),
            Value::Number(_) | Value::Bool(_) => value.clone(),
            Value::Array(items) => {
                if items.len() > MAX_LIST_ITEMS {
                    return Err(ValidationError::ListTooLong(key.clone()));
                }
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => out.push(Value::String(escape_and_truncate(s))),
                        Value::Number(_) | Value::Bool(_) => out.push(item.clone()),
                        _ => return Err(ValidationError::UnsupportedType(key.clone())),
                    }
                }
                Value::Array(out)
            }
            _ => return Err(ValidationError::UnsupportedType(key.clone())),
        };
        normalized.insert(key.clone(), clean);
    }
    Ok(normalized)
}

fn escape_and_truncate(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    if escaped.len() <= MAX_STRING_BYTES {
        return escaped;
    }
    let mut end = MAX_STRING_BYTES;
    while end > 0 && !escaped.is_char_boundary(end) {
        end -= 1;
    }
    escaped.truncate(end);
    escaped
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filename_boundary_at_200_bytes() {
        let ok = "a".repeat(200);
        assert_eq!(validate_filename(&ok).unwrap(), ok);
        let too_long = "a".repeat(201);
        assert!(matches!(
            validate_filename(&too_long),
            Err(ValidationError::NameTooLong(201))
        ));
    }

    #[test]
    fn filename_rejects_reserved_device_names() {
        for name in ["CON", "con", "Con.txt", "lpt3", "NUL.md"] {
            assert!(validate_filename(name).is_err(), "{name} should be rejected");
        }
        assert!(validate_filename("console.md").is_ok());
        assert!(validate_filename("lpt10.md").is_ok());
    }

    #[test]
    fn filename_rejects_control_chars_and_separators() {
        assert!(validate_filename("a\nb").is_err());
        assert!(validate_filename("a\0b").is_err());
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("a\\b").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("").is_err());
    }

    #[test]
    fn multibyte_filename_measured_in_bytes() {
        // 67 three-byte chars = 201 bytes.
        let name = "語".repeat(67);
        assert!(validate_filename(&name).is_err());
        let name = "語".repeat(66); // 198 bytes
        assert!(validate_filename(&name).is_ok());
    }

    #[test]
    fn path_stays_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = validate_path(dir.path(), "notes/a.md").unwrap();
        assert!(resolved.ends_with("notes/a.md"));
    }

    #[test]
    fn path_escape_attempts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for rel in ["../evil.md", "notes/../../evil.md", "/etc/passwd", "a/../.."] {
            assert!(validate_path(dir.path(), rel).is_err(), "{rel} should be rejected");
        }
    }

    #[test]
    fn dot_segments_normalize_without_escaping() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = validate_path(dir.path(), "notes/./sub/../a.md").unwrap();
        assert!(resolved.ends_with("notes/a.md"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_base_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("link")).unwrap();
        assert!(validate_path(base.path(), "link/a.md").is_err());
    }

    #[test]
    fn scan_flags_script_and_sql() {
        assert_eq!(scan_content("hello world"), ContentScan::Clean);
        match scan_content("<script>alert(1)</script>") {
            ContentScan::Dangerous(hits) => assert_eq!(hits, vec!["script_tag"]),
            ContentScan::Clean => panic!("script tag not flagged"),
        }
        match scan_content("x' OR '1'='1") {
            ContentScan::Dangerous(hits) => assert!(hits.contains(&"sql_fragment".to_string())),
            ContentScan::Clean => panic!("sql fragment not flagged"),
        }
    }

    #[test]
    fn scan_flags_event_handlers_and_urls() {
        assert!(matches!(
            scan_content(r#"<img onerror="x()">"#),
            ContentScan::Dangerous(_)
        ));
        assert!(matches!(scan_content("javascript:void(0)"), ContentScan::Dangerous(_)));
        assert!(matches!(
            scan_content("data:text/html;base64,PHNjcmlwdD4="),
            ContentScan::Dangerous(_)
        ));
    }

    #[test]
    fn frontmatter_escapes_and_truncates_strings() {
        let mut map = Map::new();
        map.insert("title".to_string(), json!("<b>hi</b>"));
        let out = validate_frontmatter(&map).unwrap();
        assert_eq!(out["title"], json!("&lt;b&gt;hi&lt;/b&gt;"));

        let mut map = Map::new();
        map.insert("body".to_string(), json!("x".repeat(2000)));
        let out = validate_frontmatter(&map).unwrap();
        assert_eq!(out["body"].as_str().unwrap().len(), 1000);
    }

    #[test]
    fn frontmatter_rejects_bad_keys_and_types() {
        let mut map = Map::new();
        map.insert("1bad".to_string(), json!("x"));
        assert!(validate_frontmatter(&map).is_err());

        let mut map = Map::new();
        map.insert("nested".to_string(), json!({"a": 1}));
        assert!(matches!(
            validate_frontmatter(&map),
            Err(ValidationError::UnsupportedType(_))
        ));

        let mut map = Map::new();
        map.insert("tags".to_string(), json!(vec!["t"; 51]));
        assert!(matches!(
            validate_frontmatter(&map),
            Err(ValidationError::ListTooLong(_))
        ));
    }

    #[test]
    fn frontmatter_passes_scalars_and_short_lists() {
        let mut map = Map::new();
        map.insert("count".to_string(), json!(3));
        map.insert("draft".to_string(), json!(true));
        map.insert("tags".to_string(), json!(["a", "b"]));
        let out = validate_frontmatter(&map).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out["tags"], json!(["a", "b"]));
    }
}

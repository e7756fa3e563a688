//! Note domain model.
//!
//! # Responsibility
//! - Define the canonical note record persisted by the note store.
//! - Validate note keys and normalize tag sets.
//!
//! # Invariants
//! - `NoteKey` is a relative, slash-separated path with no empty, `.`/`..`
//!   or hidden segments.
//! - Persisted tag sets are lowercase, trimmed, deduplicated and sorted.
//! - `sequence` increases by one on every write to the same key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Stable identifier for a note: a path-like slug such as `projects/rust`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NoteKey(String);

/// Rejected key input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyError {
    pub value: String,
    pub reason: &'static str,
}

impl Display for KeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid note key `{}`: {}", self.value, self.reason)
    }
}

impl Error for KeyError {}

impl NoteKey {
    /// Parses and sanitizes a caller-provided key.
    ///
    /// Surrounding whitespace and leading/trailing slashes are stripped, so
    /// `/etc/passwd` becomes `etc/passwd` and stays inside the content root.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let reject = |reason| KeyError {
            value: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim().trim_matches('/').trim();
        if trimmed.is_empty() {
            return Err(reject("key cannot be empty"));
        }
        if trimmed.contains('\\') {
            return Err(reject("backslashes are not allowed"));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(reject("control characters are not allowed"));
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(reject("empty path segment"));
            }
            if segment == "." || segment == ".." {
                return Err(reject("relative path segments are not allowed"));
            }
            if segment.starts_with('.') {
                return Err(reject("hidden path segments are not allowed"));
            }
            segments.push(segment);
        }

        Ok(Self(segments.join("/")))
    }

    /// Derives a key from a note title (`"Rust Tips!"` -> `rust-tips`).
    pub fn from_title(title: &str) -> Result<Self, KeyError> {
        let mut slug = String::with_capacity(title.len());
        let mut pending_dash = false;
        for ch in title.trim().chars() {
            if ch.is_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.extend(ch.to_lowercase());
            } else {
                pending_dash = true;
            }
        }

        if slug.is_empty() {
            return Err(KeyError {
                value: title.to_string(),
                reason: "title does not contain any usable characters",
            });
        }
        Self::parse(&slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Folder part of the key, if the key is nested.
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Last path segment.
    pub fn file_stem(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, stem)| stem)
    }

    /// Returns `true` when `self` lives somewhere below `folder`.
    pub fn is_under(&self, folder: &NoteKey) -> bool {
        self.0.len() > folder.0.len()
            && self.0.starts_with(folder.0.as_str())
            && self.0.as_bytes()[folder.0.len()] == b'/'
    }

    /// Appends one segment (`projects` + `index` -> `projects/index`).
    pub fn child(&self, segment: &str) -> Result<Self, KeyError> {
        Self::parse(&format!("{}/{}", self.0, segment))
    }
}

impl Display for NoteKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NoteKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NoteKey> for String {
    fn from(value: NoteKey) -> Self {
        value.0
    }
}

impl AsRef<str> for NoteKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical note record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub key: NoteKey,
    pub title: String,
    /// Markdown body without front matter.
    pub content: String,
    /// Normalized tag set, see [`normalize_tags`].
    pub tags: Vec<String>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
    /// Number of writes applied to this key; keeps every write a distinct blob.
    pub sequence: u64,
}

impl Note {
    /// Returns `true` when the note carries every tag in `tags`.
    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|wanted| self.tags.iter().any(|tag| tag == wanted))
    }

    /// Text fed to the tokenizer: title and body.
    pub fn indexable_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

/// Create request for the note store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNote {
    /// Explicit key; derived from `title` when `None`.
    pub key: Option<String>,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Preserved creation time for imports; defaults to now.
    pub created_at: Option<i64>,
    /// Preserved modification time for imports; also used as commit time.
    pub updated_at: Option<i64>,
}

impl NewNote {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update request. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl NoteUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Normalizes one tag value.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalizes, deduplicates and sorts tag values.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut unique = BTreeSet::new();
    for tag in tags {
        if let Some(value) = normalize_tag(tag) {
            unique.insert(value);
        }
    }
    unique.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_tags, NoteKey};

    #[test]
    fn parse_strips_slashes_and_whitespace() {
        assert_eq!(NoteKey::parse("  my-note  ").unwrap().as_str(), "my-note");
        assert_eq!(NoteKey::parse("/etc/passwd").unwrap().as_str(), "etc/passwd");
        assert_eq!(
            NoteKey::parse("folder/my-note").unwrap().as_str(),
            "folder/my-note"
        );
    }

    #[test]
    fn parse_rejects_traversal_and_empty_values() {
        for raw in ["", "   ", "/", "../outside", "foo/../../outside", "a//b", ".git/config"] {
            assert!(NoteKey::parse(raw).is_err(), "`{raw}` should be rejected");
        }
    }

    #[test]
    fn from_title_builds_slug() {
        assert_eq!(
            NoteKey::from_title("Rust: Tips & Tricks!").unwrap().as_str(),
            "rust-tips-tricks"
        );
        assert!(NoteKey::from_title("!!!").is_err());
    }

    #[test]
    fn is_under_matches_whole_segments_only() {
        let folder = NoteKey::parse("projects").unwrap();
        assert!(NoteKey::parse("projects/foo").unwrap().is_under(&folder));
        assert!(!NoteKey::parse("projects-old/foo").unwrap().is_under(&folder));
        assert!(!folder.is_under(&folder));
    }

    #[test]
    fn normalize_tags_lowercases_and_deduplicates() {
        let tags = vec!["Work".to_string(), " work ".to_string(), "IMPORTANT".to_string()];
        assert_eq!(normalize_tags(&tags), vec!["important", "work"]);
    }
}

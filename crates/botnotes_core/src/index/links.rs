//! Wiki-style reference extraction.
//!
//! # Responsibility
//! - Extract `[[target]]` and `[[target|display]]` references from markdown.
//! - Rewrite references when a note key changes.
//!
//! # Invariants
//! - Targets are sanitized with the same rules as note keys; invalid targets
//!   are ignored rather than stored.
//! - A trailing `.md` on a target is dropped (`[[a/b.md]]` -> `a/b`).
//! - Line numbers are 1-based.

use crate::model::note::NoteKey;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static WIKILINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]|\n]+)(?:\|([^\[\]\n]*))?\]\]").expect("valid wikilink regex")
});

/// One reference found in note content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiLink {
    pub target: NoteKey,
    pub display_text: Option<String>,
    pub line_number: u32,
}

/// Extracts every valid reference in `content`, in order of appearance.
pub fn extract_links(content: &str) -> Vec<WikiLink> {
    let mut links = Vec::new();
    for (line_index, line) in content.lines().enumerate() {
        for caps in WIKILINK_RE.captures_iter(line) {
            let Some(target) = caps.get(1).and_then(|m| parse_target(m.as_str())) else {
                continue;
            };
            let display_text = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|text| !text.is_empty());
            links.push(WikiLink {
                target,
                display_text,
                line_number: u32::try_from(line_index + 1).unwrap_or(u32::MAX),
            });
        }
    }
    links
}

/// Rewrites references to `old` so they point at `new`, keeping display text.
pub fn replace_link_target(content: &str, old: &NoteKey, new: &NoteKey) -> String {
    WIKILINK_RE
        .replace_all(content, |caps: &Captures<'_>| {
            let points_to_old = caps
                .get(1)
                .and_then(|m| parse_target(m.as_str()))
                .is_some_and(|target| &target == old);
            if !points_to_old {
                return caps[0].to_string();
            }
            match caps.get(2) {
                Some(display) => format!("[[{new}|{}]]", display.as_str()),
                None => format!("[[{new}]]"),
            }
        })
        .into_owned()
}

fn parse_target(raw: &str) -> Option<NoteKey> {
    let trimmed = raw.trim();
    let without_extension = trimmed.strip_suffix(".md").unwrap_or(trimmed);
    NoteKey::parse(without_extension).ok()
}

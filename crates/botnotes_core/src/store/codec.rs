//! Note file codec: YAML front matter followed by the markdown body.
//!
//! ```text
//! ---
//! title: Rust tips
//! tags: [rust, tips]
//! created_at: 1700000000000
//! updated_at: 1700000005000
//! sequence: 2
//! ---
//! body...
//! ```
//!
//! Files without front matter (the first data generation) decode with a
//! title taken from the first `# ` heading or the key, no tags, and the
//! caller-provided fallback timestamp.

use crate::model::note::{Note, NoteKey};
use crate::store::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

const DELIMITER: &str = "---";

#[derive(Debug, Serialize, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<i64>,
    #[serde(default)]
    sequence: u64,
}

/// Decoded note plus facts about its stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedNote {
    pub note: Note,
    pub has_front_matter: bool,
}

/// Serializes a note to its on-disk text.
pub fn encode_note(note: &Note) -> StoreResult<String> {
    let front_matter = FrontMatter {
        title: note.title.clone(),
        tags: note.tags.clone(),
        created_at: Some(note.created_at),
        updated_at: Some(note.updated_at),
        sequence: note.sequence,
    };
    let yaml = serde_yaml::to_string(&front_matter).map_err(|err| {
        StoreError::InvalidData(format!("cannot encode note '{}': {err}", note.key))
    })?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{}", note.content))
}

/// Parses on-disk text for `key`. Tags are returned exactly as stored.
pub fn decode_note(key: &NoteKey, text: &str, fallback_ms: i64) -> StoreResult<DecodedNote> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let Some((yaml, body)) = split_front_matter(text) else {
        return Ok(DecodedNote {
            note: Note {
                key: key.clone(),
                title: heading_title(text).unwrap_or_else(|| key.file_stem().to_string()),
                content: text.to_string(),
                tags: Vec::new(),
                created_at: fallback_ms,
                updated_at: fallback_ms,
                sequence: 0,
            },
            has_front_matter: false,
        });
    };

    let front_matter: FrontMatter = if yaml.trim().is_empty() {
        FrontMatter {
            title: String::new(),
            tags: Vec::new(),
            created_at: None,
            updated_at: None,
            sequence: 0,
        }
    } else {
        serde_yaml::from_str(yaml).map_err(|err| {
            StoreError::InvalidData(format!("note '{key}' has malformed front matter: {err}"))
        })?
    };

    let title = if front_matter.title.trim().is_empty() {
        heading_title(body).unwrap_or_else(|| key.file_stem().to_string())
    } else {
        front_matter.title
    };
    let updated_at = front_matter.updated_at.unwrap_or(fallback_ms);

    Ok(DecodedNote {
        note: Note {
            key: key.clone(),
            title,
            content: body.to_string(),
            tags: front_matter.tags,
            created_at: front_matter.created_at.unwrap_or(updated_at),
            updated_at,
            sequence: front_matter.sequence,
        },
        has_front_matter: true,
    })
}

fn split_front_matter(text: &str) -> Option<(&str, &str)> {
    let first_line_end = text.find('\n')?;
    if text[..first_line_end].trim_end() != DELIMITER {
        return None;
    }

    let rest = &text[first_line_end + 1..];
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn heading_title(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

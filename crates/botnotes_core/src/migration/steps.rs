//! Registered data migration steps.

use super::MigrationReport;
use crate::model::note::{normalize_tags, NoteKey};
use crate::store::{NoteStore, StoreResult};
use std::collections::BTreeSet;

const FOLDER_NOTE: &str = "index";

/// Finds notes whose key is also a folder holding other notes.
///
/// Returns sorted `(key, key/index)` pairs; keys whose `index` child already
/// exists are left alone.
pub fn find_overlapping_notes(keys: &[NoteKey]) -> Vec<(NoteKey, NoteKey)> {
    let existing: BTreeSet<&NoteKey> = keys.iter().collect();
    let mut overlaps: Vec<(NoteKey, NoteKey)> = keys
        .iter()
        .filter(|key| keys.iter().any(|other| other.is_under(key)))
        .filter_map(|key| {
            let target = key.child(FOLDER_NOTE).ok()?;
            (!existing.contains(&target)).then(|| (key.clone(), target))
        })
        .collect();
    overlaps.sort();
    overlaps
}

/// v2: `x` next to `x/...` becomes `x/index`.
pub(super) fn resolve_folder_overlaps(
    store: &NoteStore,
    author: &str,
    report: &mut MigrationReport,
) -> StoreResult<()> {
    let keys = store.keys_unchecked()?;
    for (old, new) in find_overlapping_notes(&keys) {
        store.move_unchecked(&old, &new, author)?;
        report.moved.push((old, new));
    }
    Ok(())
}

/// v3: every note carries front matter with a normalized tag set.
pub(super) fn normalize_front_matter(
    store: &NoteStore,
    author: &str,
    report: &mut MigrationReport,
) -> StoreResult<()> {
    for key in store.keys_unchecked()? {
        let Some(decoded) = store.load_decoded(&key)? else {
            continue;
        };
        let tags = normalize_tags(&decoded.note.tags);
        if decoded.has_front_matter && tags == decoded.note.tags {
            continue;
        }

        let mut note = decoded.note;
        note.tags = tags;
        store.rewrite_unchecked(note, author, format!("Normalize front matter of '{key}'"))?;
        report.rewritten.push(key);
    }
    Ok(())
}

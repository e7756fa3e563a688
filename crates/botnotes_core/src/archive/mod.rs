//! Archive transfer: portable export and import of the note corpus.
//!
//! # Responsibility
//! - Serialize every note with its tags, timestamps and last author into a
//!   gzip-compressed tarball.
//! - Import archives in merge or replace mode.
//!
//! # Invariants
//! - Imports write only through `NoteStore` operations, so every imported
//!   note gets a revision and a write-through index update.
//! - Every record is checked against the rules of `create` before the first
//!   write, so an invalid record never leaves a half-imported or emptied
//!   store.
//! - `Merge { on_conflict: Abort }` checks every key before the first write.
//! - The index is not exported; it is rebuilt from the imported notes.
//!
//! Layout:
//!
//! ```text
//! manifest.json        {"format":"botnotes-archive","version":1,...}
//! notes/<key>.json     one record per note
//! ```

use crate::model::note::{NewNote, NoteKey};
use crate::store::{validate_new_note, NoteFilter, NoteStore, StoreError, StoreResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const ARCHIVE_FORMAT: &str = "botnotes-archive";
pub const ARCHIVE_VERSION: u32 = 1;
const MANIFEST_PATH: &str = "manifest.json";
const NOTES_PREFIX: &str = "notes/";
const RECORD_EXTENSION: &str = ".json";

/// Self-describing archive header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format: String,
    pub version: u32,
    /// RFC 3339 export time.
    pub exported_at: String,
    pub note_count: usize,
}

/// One archived note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub key: NoteKey,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Author of the note's latest revision.
    pub author: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NoteRecord {
    fn into_new_note(self) -> NewNote {
        NewNote {
            key: Some(self.key.into()),
            title: self.title,
            content: self.content,
            tags: self.tags,
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Parsed archive content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveContents {
    pub manifest: ArchiveManifest,
    /// Sorted by key.
    pub records: Vec<NoteRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Keep the existing note and leave the archived one out.
    Skip,
    /// Fail with `Conflict` before writing anything.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Insert archived notes whose keys are new.
    Merge { on_conflict: ConflictPolicy },
    /// Delete every existing note, then create every archived note.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub note_count: usize,
    /// Destination file, for path-based exports.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub created: Vec<NoteKey>,
    pub skipped: Vec<NoteKey>,
    pub deleted: usize,
}

/// Default export file name for the local date, e.g. `notes-backup-2024-05-01.tar.gz`.
pub fn default_archive_name() -> String {
    format!(
        "notes-backup-{}.tar.gz",
        chrono::Local::now().format("%Y-%m-%d")
    )
}

/// Export and import over one note store.
pub struct ArchiveTransfer<'s> {
    store: &'s NoteStore,
}

impl<'s> ArchiveTransfer<'s> {
    pub fn new(store: &'s NoteStore) -> Self {
        Self { store }
    }

    /// Writes every note as a gzip tarball to `writer`.
    pub fn export<W: Write>(&self, writer: W) -> StoreResult<ExportReport> {
        let started_at = Instant::now();
        let mut records = Vec::new();
        for note in self.store.list(&NoteFilter::default())? {
            let note = note?;
            let author = self.store.last_author(&note.key)?.unwrap_or_default();
            records.push(NoteRecord {
                key: note.key,
                title: note.title,
                content: note.content,
                tags: note.tags,
                author,
                created_at: note.created_at,
                updated_at: note.updated_at,
            });
        }

        let manifest = ArchiveManifest {
            format: ARCHIVE_FORMAT.to_string(),
            version: ARCHIVE_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            note_count: records.len(),
        };

        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let now_secs = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        append_json(&mut builder, MANIFEST_PATH, &manifest, now_secs)?;
        for record in &records {
            let path = format!("{NOTES_PREFIX}{}{RECORD_EXTENSION}", record.key);
            let mtime = u64::try_from(record.updated_at.div_euclid(1000)).unwrap_or_default();
            append_json(&mut builder, &path, record, mtime)?;
        }
        builder.into_inner()?.finish()?;

        info!(
            "event=archive_export module=archive status=ok notes={} duration_ms={}",
            records.len(),
            started_at.elapsed().as_millis()
        );
        Ok(ExportReport {
            note_count: records.len(),
            path: None,
        })
    }

    /// Exports to `path`; a directory receives [`default_archive_name`].
    pub fn export_to_path(&self, path: &Path) -> StoreResult<ExportReport> {
        let target = if path.is_dir() {
            path.join(default_archive_name())
        } else {
            path.to_path_buf()
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::File::create(&target)?;
        let mut report = self.export(std::io::BufWriter::new(file))?;
        report.path = Some(target);
        Ok(report)
    }

    /// Imports an archive produced by [`ArchiveTransfer::export`].
    ///
    /// `author` signs deletions in replace mode and stands in for records
    /// without an author.
    pub fn import<R: Read>(
        &self,
        reader: R,
        mode: ImportMode,
        author: &str,
    ) -> StoreResult<ImportReport> {
        let started_at = Instant::now();
        let contents = read_archive(reader)?;
        let notes = contents
            .records
            .into_iter()
            .map(|record| {
                let record_author = if record.author.trim().is_empty() {
                    author.to_string()
                } else {
                    record.author.clone()
                };
                let new = record.into_new_note();
                let (key, _) = validate_new_note(&new)?;
                Ok((key, new, record_author))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let existing: BTreeSet<NoteKey> = self.store.list_keys()?.into_iter().collect();
        let mut report = ImportReport::default();

        match mode {
            ImportMode::Merge {
                on_conflict: ConflictPolicy::Abort,
            } => {
                if let Some((key, _, _)) = notes.iter().find(|(key, _, _)| existing.contains(key)) {
                    return Err(StoreError::Conflict(key.clone()));
                }
            }
            ImportMode::Merge {
                on_conflict: ConflictPolicy::Skip,
            } => {}
            ImportMode::Replace => {
                report.deleted = self.delete_all(&existing, author)?;
            }
        }
        let skip_conflicts = mode
            == ImportMode::Merge {
                on_conflict: ConflictPolicy::Skip,
            };

        for (_, new, record_author) in notes {
            match self.store.create(new, &record_author) {
                Ok(key) => report.created.push(key),
                Err(StoreError::Conflict(key)) if skip_conflicts => report.skipped.push(key),
                Err(err) => return Err(err),
            }
        }

        info!(
            "event=archive_import module=archive status=ok mode={} created={} skipped={} deleted={} duration_ms={}",
            mode_label(mode),
            report.created.len(),
            report.skipped.len(),
            report.deleted,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Deletes every note, leaving tombstones in history. Returns the count.
    pub fn clear(&self, author: &str) -> StoreResult<usize> {
        let keys: BTreeSet<NoteKey> = self.store.list_keys()?.into_iter().collect();
        let deleted = self.delete_all(&keys, author)?;
        info!(
            "event=notes_clear module=archive status=ok deleted={}",
            deleted
        );
        Ok(deleted)
    }

    fn delete_all(&self, keys: &BTreeSet<NoteKey>, author: &str) -> StoreResult<usize> {
        let mut deleted = 0;
        for key in keys {
            match self.store.delete(key.as_str(), author) {
                Ok(_) => deleted += 1,
                // Deleted concurrently.
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }
}

/// Parses and validates an archive without touching any store.
pub fn read_archive<R: Read>(reader: R) -> StoreResult<ArchiveContents> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut manifest: Option<ArchiveManifest> = None;
    let mut records = Vec::new();
    let mut seen = BTreeSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut text = String::new();
        entry.read_to_string(&mut text)?;

        if path == MANIFEST_PATH {
            manifest = Some(parse_json(&path, &text)?);
            continue;
        }
        let Some(key_path) = path
            .strip_prefix(NOTES_PREFIX)
            .and_then(|rest| rest.strip_suffix(RECORD_EXTENSION))
        else {
            continue;
        };

        let record: NoteRecord = parse_json(&path, &text)?;
        if record.key.as_str() != key_path {
            return Err(StoreError::Archive(format!(
                "record `{path}` holds key '{}'",
                record.key
            )));
        }
        if !seen.insert(record.key.clone()) {
            return Err(StoreError::Archive(format!(
                "duplicate record for '{}'",
                record.key
            )));
        }
        records.push(record);
    }

    let manifest =
        manifest.ok_or_else(|| StoreError::Archive(format!("missing {MANIFEST_PATH}")))?;
    if manifest.format != ARCHIVE_FORMAT {
        return Err(StoreError::Archive(format!(
            "unknown archive format `{}`",
            manifest.format
        )));
    }
    if manifest.version > ARCHIVE_VERSION {
        return Err(StoreError::Archive(format!(
            "archive version {} is newer than supported version {ARCHIVE_VERSION}",
            manifest.version
        )));
    }
    if manifest.note_count != records.len() {
        return Err(StoreError::Archive(format!(
            "manifest lists {} notes but archive holds {}",
            manifest.note_count,
            records.len()
        )));
    }

    records.sort_by(|left, right| left.key.cmp(&right.key));
    Ok(ArchiveContents { manifest, records })
}

fn append_json<W: Write, T: Serialize>(
    builder: &mut tar::Builder<W>,
    path: &str,
    value: &T,
    mtime: u64,
) -> StoreResult<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| StoreError::Archive(format!("cannot serialize `{path}`: {err}")))?;
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, path, data.as_slice())?;
    Ok(())
}

fn parse_json<T: for<'de> Deserialize<'de>>(path: &str, text: &str) -> StoreResult<T> {
    serde_json::from_str(text)
        .map_err(|err| StoreError::Archive(format!("invalid `{path}`: {err}")))
}

fn mode_label(mode: ImportMode) -> &'static str {
    match mode {
        ImportMode::Merge {
            on_conflict: ConflictPolicy::Skip,
        } => "merge_skip",
        ImportMode::Merge {
            on_conflict: ConflictPolicy::Abort,
        } => "merge_abort",
        ImportMode::Replace => "replace",
    }
}

//! On-disk layout of a data directory.
//!
//! ```text
//! <data_dir>/
//!   data_version            data version marker
//!   notes/                  content root, also the git working directory
//!     .git/
//!     <key>.md
//!   index/index.sqlite3     derived index
//! ```

use crate::model::note::NoteKey;
use crate::store::StoreResult;
use log::warn;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub const NOTE_EXTENSION: &str = "md";
pub const MARKER_FILE: &str = "data_version";

/// Resolved paths of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub data_dir: PathBuf,
    pub notes_dir: PathBuf,
    pub index_path: PathBuf,
    pub marker_path: PathBuf,
}

impl StoreLayout {
    /// Default layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            notes_dir: data_dir.join("notes"),
            index_path: data_dir.join("index").join("index.sqlite3"),
            marker_path: data_dir.join(MARKER_FILE),
            data_dir,
        }
    }

    /// Path of `key` relative to the notes directory, `/`-separated.
    pub fn relative_path(key: &NoteKey) -> String {
        format!("{key}.{NOTE_EXTENSION}")
    }

    pub fn note_path(&self, key: &NoteKey) -> PathBuf {
        let mut path = self.notes_dir.clone();
        if let Some(folder) = key.parent() {
            path.extend(folder.split('/'));
        }
        path.push(format!("{}.{NOTE_EXTENSION}", key.file_stem()));
        path
    }

    /// Lists every note key on disk, sorted.
    ///
    /// Hidden entries (including `.git` and in-flight temp files) are
    /// skipped. Files whose path is not a valid key are logged and skipped.
    pub fn scan_keys(&self) -> StoreResult<Vec<NoteKey>> {
        if !self.notes_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let walker = WalkDir::new(&self.notes_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(NOTE_EXTENSION) {
                continue;
            }
            match self.key_for_path(path) {
                Some(key) => keys.push(key),
                None => warn!(
                    "event=note_scan module=store status=skipped path={}",
                    path.display()
                ),
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Returns whether at least one note file exists.
    pub fn has_notes(&self) -> StoreResult<bool> {
        Ok(!self.scan_keys()?.is_empty())
    }

    fn key_for_path(&self, path: &Path) -> Option<NoteKey> {
        let relative = path.strip_prefix(&self.notes_dir).ok()?.with_extension("");
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str()?),
                _ => return None,
            }
        }
        NoteKey::parse(&segments.join("/")).ok()
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// Writes `contents` to a hidden sibling temp file, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("note");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Removes a file if present, then prunes empty parent directories up to `root`.
pub(crate) fn remove_file_pruning(path: &Path, root: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Non-empty directories fail to delete; stop there.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Reads a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

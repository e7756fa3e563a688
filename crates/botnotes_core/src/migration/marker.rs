//! Data version marker file.

use super::{CURRENT_DATA_VERSION, EARLIEST_DATA_VERSION};
use crate::store::layout::write_atomic;
use crate::store::{StoreError, StoreLayout, StoreResult};
use log::info;
use std::fs;
use std::io;
use std::path::Path;

/// Reads the marker; `None` when the file does not exist.
pub fn read_marker(path: &Path) -> StoreResult<Option<u32>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    text.trim().parse::<u32>().map(Some).map_err(|_| {
        StoreError::InvalidData(format!(
            "data version marker `{}` holds `{}`",
            path.display(),
            text.trim()
        ))
    })
}

/// Atomically replaces the marker with `version`.
pub fn write_marker(path: &Path, version: u32) -> StoreResult<()> {
    write_atomic(path, format!("{version}\n").as_bytes())?;
    Ok(())
}

/// Resolves the data version of a store.
///
/// A missing marker means the earliest version when notes exist. An empty
/// store without a marker is new and is stamped with the current version.
pub fn detect_version(layout: &StoreLayout) -> StoreResult<u32> {
    if let Some(version) = read_marker(&layout.marker_path)? {
        return Ok(version);
    }
    if layout.has_notes()? {
        return Ok(EARLIEST_DATA_VERSION);
    }

    write_marker(&layout.marker_path, CURRENT_DATA_VERSION)?;
    info!(
        "event=data_version_stamp module=migration status=ok version={}",
        CURRENT_DATA_VERSION
    );
    Ok(CURRENT_DATA_VERSION)
}

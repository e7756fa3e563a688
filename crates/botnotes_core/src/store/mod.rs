//! Note store: canonical, version-controlled note persistence.
//!
//! # Responsibility
//! - Own the on-disk note files and their front matter.
//! - Route every mutation through the version control adapter.
//! - Keep the index engine in sync with write-through updates.
//!
//! # Invariants
//! - Notes are only mutated through `NoteStore` operations.
//! - Mutations on one key are serialized; commits are serialized globally.
//! - A failed commit leaves neither a changed file nor an index update.
//!
//! # See also
//! - `crate::migration` for the data version gate checked by every operation.

use crate::index::IndexError;
use crate::model::note::{KeyError, NoteKey};
use crate::vcs::VcsError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod codec;
pub mod layout;
mod locks;
mod note_store;

pub use layout::StoreLayout;
pub use note_store::{NoteFilter, NoteIter, NoteStore};
pub(crate) use note_store::validate_new_note;

pub type StoreResult<T> = Result<T, StoreError>;

/// Current time in Unix epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Error taxonomy surfaced by store, migration and archive operations.
#[derive(Debug)]
pub enum StoreError {
    /// No live note exists for the key.
    NotFound(NoteKey),
    /// Revision id is not part of the key's history.
    RevisionNotFound { key: NoteKey, revision: String },
    /// Key already exists on create, move or import.
    Conflict(NoteKey),
    InvalidKey(KeyError),
    /// Tag input contains empty values.
    InvalidTag(String),
    /// Request is well-formed but not applicable to current state.
    InvalidOperation(String),
    /// On-disk data is older than this build expects; run the migration.
    MigrationRequired { found: u32, expected: u32 },
    /// On-disk data is newer than this build supports. Fatal.
    UnsupportedVersion { found: u32, supported: u32 },
    /// A migration step failed; the data version marker was not advanced.
    MigrationAborted { version: u32, reason: String },
    /// Index failed a consistency check; recover with a rebuild.
    IndexCorruption(String),
    /// History backend failure.
    VersionControl(VcsError),
    Index(IndexError),
    Io(std::io::Error),
    InvalidData(String),
    Archive(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "note not found: '{key}'"),
            Self::RevisionNotFound { key, revision } => {
                write!(f, "revision `{revision}` not found for note '{key}'")
            }
            Self::Conflict(key) => write!(f, "note already exists: '{key}'"),
            Self::InvalidKey(err) => write!(f, "{err}"),
            Self::InvalidTag(value) => write!(f, "invalid tag: `{value}`"),
            Self::InvalidOperation(message) => write!(f, "invalid operation: {message}"),
            Self::MigrationRequired { found, expected } => write!(
                f,
                "data version {found} requires migration to {expected}; run the migration first"
            ),
            Self::UnsupportedVersion { found, supported } => write!(
                f,
                "data version {found} is newer than supported version {supported}"
            ),
            Self::MigrationAborted { version, reason } => {
                write!(f, "migration to version {version} aborted: {reason}")
            }
            Self::IndexCorruption(message) => write!(f, "index corruption: {message}"),
            Self::VersionControl(err) => write!(f, "version control failure: {err}"),
            Self::Index(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid note data: {message}"),
            Self::Archive(message) => write!(f, "archive error: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidKey(err) => Some(err),
            Self::VersionControl(err) => Some(err),
            Self::Index(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KeyError> for StoreError {
    fn from(value: KeyError) -> Self {
        Self::InvalidKey(value)
    }
}

impl From<VcsError> for StoreError {
    fn from(value: VcsError) -> Self {
        Self::VersionControl(value)
    }
}

impl From<IndexError> for StoreError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::Corruption(message) => Self::IndexCorruption(message),
            other => Self::Index(other),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<walkdir::Error> for StoreError {
    fn from(value: walkdir::Error) -> Self {
        Self::Io(value.into())
    }
}

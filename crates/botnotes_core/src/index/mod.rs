//! Derived search and backlink index.
//!
//! # Responsibility
//! - Maintain term postings and outbound links derived from note content.
//! - Serve ranked keyword search and backlink queries.
//! - Rebuild from scratch and self-check for corruption.
//!
//! # Invariants
//! - The index is a cache: every row is reconstructible from current notes.
//! - Index state is independent of the order in which notes were applied.
//! - Backlinks are the exact transpose of stored outbound links.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod engine;
pub mod links;
pub mod tokenize;

pub use engine::{
    Backlink, IndexEngine, IndexSnapshot, RebuildStats, SearchHit, SearchQuery,
    SEARCH_DEFAULT_LIMIT, SEARCH_LIMIT_MAX,
};

pub type IndexResult<T> = Result<T, IndexError>;

/// Index-layer error.
#[derive(Debug)]
pub enum IndexError {
    Db(DbError),
    /// Index failed an internal consistency check; only a rebuild recovers.
    Corruption(String),
    InvalidData(String),
}

impl Display for IndexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Corruption(message) => write!(f, "index corruption detected: {message}"),
            Self::InvalidData(message) => write!(f, "invalid index row: {message}"),
        }
    }
}

impl Error for IndexError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for IndexError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(value: rusqlite::Error) -> Self {
        if is_corruption_error(&value) {
            return Self::Corruption(value.to_string());
        }
        Self::Db(DbError::Sqlite(value))
    }
}

fn is_corruption_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase,
                ..
            },
            _
        )
    )
}

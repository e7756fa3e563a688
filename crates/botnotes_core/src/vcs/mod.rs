//! Version control adapter contracts.
//!
//! # Responsibility
//! - Define the narrow history interface the note store depends on.
//! - Keep backend details (git objects, signatures) out of store logic.
//!
//! # Invariants
//! - `commit` records exactly the listed paths as they exist in the working
//!   directory at call time.
//! - `history` is ordered newest first and lists only commits that changed
//!   the requested path.
//! - Commits are never rewritten or removed.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod git;

pub use git::GitVersionControl;

pub type VcsResult<T> = Result<T, VcsError>;

/// History backend failure.
#[derive(Debug)]
pub enum VcsError {
    Git(git2::Error),
    Io(std::io::Error),
    /// Requested revision id does not exist in the backend.
    UnknownRevision(String),
    /// Stored object cannot be decoded.
    InvalidData(String),
    /// Any other backend-specific failure.
    Backend(String),
}

impl Display for VcsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git(err) => write!(f, "git error: {err}"),
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::UnknownRevision(rev) => write!(f, "unknown revision `{rev}`"),
            Self::InvalidData(message) => write!(f, "invalid history data: {message}"),
            Self::Backend(message) => write!(f, "history backend failure: {message}"),
        }
    }
}

impl Error for VcsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Git(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<git2::Error> for VcsError {
    fn from(value: git2::Error) -> Self {
        Self::Git(value)
    }
}

impl From<std::io::Error> for VcsError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// How a path changed in the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Write,
    Remove,
}

/// One changed path, relative to the backend working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// Author and message attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub author: String,
    /// Explicit author time in epoch milliseconds; `None` means now.
    pub timestamp_ms: Option<i64>,
    pub message: String,
}

/// Recorded commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub author: String,
    pub timestamp_ms: i64,
    pub message: String,
}

/// One history entry of a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRevision {
    pub commit: CommitInfo,
    /// `false` when this commit removed the path.
    pub present: bool,
}

/// Swappable history backend.
pub trait VersionControl: Send + Sync {
    /// Records the listed working-directory changes as one commit.
    fn commit(&self, changes: &[PathChange], meta: &CommitMeta) -> VcsResult<CommitInfo>;
    /// Id of the newest commit; `None` before the first commit.
    fn head(&self) -> VcsResult<Option<String>>;
    /// Lists commits that changed `path`, newest first.
    fn history(&self, path: &str) -> VcsResult<Vec<PathRevision>>;
    /// Most recent commit that changed `path`.
    fn latest(&self, path: &str) -> VcsResult<Option<PathRevision>> {
        Ok(self.history(path)?.into_iter().next())
    }
    /// Reads `path` as of `revision`; `None` when absent at that revision.
    fn read_at(&self, revision: &str, path: &str) -> VcsResult<Option<String>>;
    /// Unified diff of `path` between two revisions.
    fn diff(&self, path: &str, from_revision: &str, to_revision: &str) -> VcsResult<String>;
}

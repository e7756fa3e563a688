//! Revision model.
//!
//! A revision is a read-only view over one history entry of one note key.

use crate::model::note::{Note, NoteKey};
use serde::{Deserialize, Serialize};

/// Immutable historical snapshot of a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Backend revision id (commit id for the git backend).
    pub id: String,
    pub key: NoteKey,
    pub author: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub message: String,
    /// Previous revision of the same key, if any.
    pub parent: Option<String>,
    /// Note as of this revision; `None` for tombstones.
    pub snapshot: Option<Note>,
}

impl Revision {
    /// Returns whether this revision records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.snapshot.is_none()
    }
}

//! Domain model for notes and their revisions.
//!
//! # Responsibility
//! - Define canonical note and revision shapes used across core.
//! - Own key and tag normalization rules shared by store and index.
//!
//! # Invariants
//! - Every note is identified by a validated `NoteKey`.
//! - Deletion is represented by tombstone revisions, never by history rewrite.

pub mod note;
pub mod revision;

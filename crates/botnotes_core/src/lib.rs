//! Core engine of BotNotes, a personal knowledge base.
//!
//! Notes live as markdown files with YAML front matter under a git
//! versioned content root. A SQLite index serves search and backlinks, and
//! a data version marker gates the store until pending migrations ran.

pub mod archive;
pub mod config;
pub mod db;
pub mod index;
pub mod logging;
pub mod migration;
pub mod model;
pub mod store;
pub mod vcs;

pub use archive::{ArchiveTransfer, ConflictPolicy, ExportReport, ImportMode, ImportReport};
pub use config::{ConfigError, StoreConfig};
pub use index::{Backlink, IndexEngine, RebuildStats, SearchHit, SearchQuery};
pub use logging::{default_log_level, init_from_config, init_logging, logging_status};
pub use migration::{
    run_migrations, MigrationPlan, MigrationReport, MigrationState, Migrator,
    CURRENT_DATA_VERSION,
};
pub use model::note::{NewNote, Note, NoteKey, NoteUpdate};
pub use model::revision::Revision;
pub use store::{NoteFilter, NoteStore, StoreError, StoreResult};
pub use vcs::{GitVersionControl, VersionControl};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

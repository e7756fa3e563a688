//! Data version migration pipeline.
//!
//! # Responsibility
//! - Detect the data version of a store from its marker file.
//! - Plan and apply the registered steps between that version and
//!   [`CURRENT_DATA_VERSION`].
//! - Initialize git history for note directories that predate it.
//!
//! # Invariants
//! - Step versions are strictly increasing.
//! - Steps re-derive their work from current state, so a retried
//!   migration picks up where a failed one stopped.
//! - The marker is written only after every step succeeded; the index is
//!   rebuilt right after.
//!
//! # See also
//! - `crate::db::migrations` for the index schema, which is versioned
//!   separately.

use crate::model::note::NoteKey;
use crate::store::{NoteStore, StoreError, StoreResult};
use crate::vcs::{CommitInfo, CommitMeta, GitVersionControl};
use log::{error, info};
use std::time::Instant;

pub mod marker;
mod steps;

pub use steps::find_overlapping_notes;

/// Version assumed for stores without a marker.
pub const EARLIEST_DATA_VERSION: u32 = 1;
/// Version this build reads and writes.
pub const CURRENT_DATA_VERSION: u32 = 3;

/// Default commit author for migration commits.
pub const MIGRATION_AUTHOR: &str = "migration";
/// Commit author for the initial history import.
pub const SYSTEM_AUTHOR: &str = "BotNotes System";
const INITIAL_IMPORT_MESSAGE: &str = "Initial import of existing notes";

type StepFn = fn(&NoteStore, &str, &mut MigrationReport) -> StoreResult<()>;

#[derive(Clone, Copy)]
struct Step {
    version: u32,
    description: &'static str,
    apply: StepFn,
}

const STEPS: &[Step] = &[
    Step {
        version: 2,
        description: "move notes that overlap a folder to <folder>/index",
        apply: steps::resolve_folder_overlaps,
    },
    Step {
        version: 3,
        description: "normalize front-matter tags and add front matter to plain files",
        apply: steps::normalize_front_matter,
    },
];

/// Returns the newest data version a registered step produces.
pub fn latest_version() -> u32 {
    STEPS
        .last()
        .map_or(EARLIEST_DATA_VERSION, |step| step.version)
}

/// One step scheduled by a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub version: u32,
    pub description: &'static str,
}

/// Ordered steps from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub from: u32,
    pub to: u32,
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of an applied migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// `(old_key, new_key)` for notes moved by the folder overlap step.
    pub moved: Vec<(NoteKey, NoteKey)>,
    /// Notes rewritten in place.
    pub rewritten: Vec<NoteKey>,
    /// Notes in the index after the final rebuild.
    pub notes_indexed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Unknown,
    VersionDetected(u32),
    PlanComputed(MigrationPlan),
    Applied(MigrationReport),
    Aborted { version: u32, reason: String },
}

/// Drives one store through `detect`, `plan` and `apply`.
pub struct Migrator<'s> {
    store: &'s NoteStore,
    state: MigrationState,
}

impl<'s> Migrator<'s> {
    pub fn new(store: &'s NoteStore) -> Self {
        Self {
            store,
            state: MigrationState::Unknown,
        }
    }

    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    /// Reads the data version of the store.
    pub fn detect(&mut self) -> StoreResult<u32> {
        let version = self.store.data_version();
        if version > CURRENT_DATA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: version,
                supported: CURRENT_DATA_VERSION,
            });
        }
        self.state = MigrationState::VersionDetected(version);
        Ok(version)
    }

    /// Computes the steps needed to reach [`CURRENT_DATA_VERSION`].
    ///
    /// # Errors
    /// - `InvalidOperation` when `detect` has not run.
    pub fn plan(&mut self) -> StoreResult<MigrationPlan> {
        let from = match &self.state {
            MigrationState::VersionDetected(version) => *version,
            MigrationState::PlanComputed(plan) => plan.from,
            _ => {
                return Err(StoreError::InvalidOperation(
                    "detect the data version before planning".to_string(),
                ))
            }
        };

        let steps = STEPS
            .iter()
            .filter(|step| step.version > from && step.version <= CURRENT_DATA_VERSION)
            .map(|step| PlannedStep {
                version: step.version,
                description: step.description,
            })
            .collect();
        let plan = MigrationPlan {
            from,
            to: CURRENT_DATA_VERSION.max(from),
            steps,
        };
        self.state = MigrationState::PlanComputed(plan.clone());
        Ok(plan)
    }

    /// Applies `plan`, which must be the plan computed last by this migrator.
    ///
    /// # Errors
    /// - `InvalidOperation` for a plan that is not current.
    /// - `MigrationAborted` when a step fails; the marker is left unchanged.
    pub fn apply(&mut self, plan: &MigrationPlan, author: &str) -> StoreResult<MigrationReport> {
        match &self.state {
            MigrationState::PlanComputed(computed) if computed == plan => {}
            _ => {
                return Err(StoreError::InvalidOperation(
                    "migration plan is not the one computed for this store".to_string(),
                ))
            }
        }
        let found = self.store.data_version();
        if found != plan.from {
            return Err(StoreError::InvalidOperation(format!(
                "data version changed from {} to {found} since planning",
                plan.from
            )));
        }

        let mut report = MigrationReport {
            from: plan.from,
            to: plan.to,
            ..MigrationReport::default()
        };
        if plan.is_empty() {
            self.state = MigrationState::Applied(report.clone());
            return Ok(report);
        }

        let started_at = Instant::now();
        info!(
            "event=data_migrate module=migration status=start from={} to={}",
            plan.from, plan.to
        );

        for planned in &plan.steps {
            let Some(step) = STEPS.iter().find(|step| step.version == planned.version) else {
                return Err(StoreError::InvalidOperation(format!(
                    "no migration step registered for version {}",
                    planned.version
                )));
            };
            if let Err(err) = (step.apply)(self.store, author, &mut report) {
                let reason = err.to_string();
                error!(
                    "event=data_migrate module=migration status=error version={} duration_ms={} error={}",
                    step.version,
                    started_at.elapsed().as_millis(),
                    reason
                );
                self.state = MigrationState::Aborted {
                    version: step.version,
                    reason: reason.clone(),
                };
                return Err(StoreError::MigrationAborted {
                    version: step.version,
                    reason,
                });
            }
            info!(
                "event=data_migrate_step module=migration status=ok version={}",
                step.version
            );
        }

        self.store.set_data_version(plan.to)?;
        let stats = self.store.rebuild_unchecked()?;
        report.notes_indexed = stats.notes_indexed;

        info!(
            "event=data_migrate module=migration status=ok from={} to={} moved={} rewritten={} duration_ms={}",
            plan.from,
            plan.to,
            report.moved.len(),
            report.rewritten.len(),
            started_at.elapsed().as_millis()
        );
        self.state = MigrationState::Applied(report.clone());
        Ok(report)
    }
}

/// Detects, plans and applies every pending step.
pub fn run_migrations(store: &NoteStore, author: &str) -> StoreResult<MigrationReport> {
    let mut migrator = Migrator::new(store);
    migrator.detect()?;
    let plan = migrator.plan()?;
    migrator.apply(&plan, author)
}

/// Commits every note already present in a freshly created repository.
///
/// Returns `None` when the notes directory was empty.
pub fn initialize_history(vcs: &GitVersionControl) -> StoreResult<Option<CommitInfo>> {
    let meta = CommitMeta {
        author: SYSTEM_AUTHOR.to_string(),
        timestamp_ms: None,
        message: INITIAL_IMPORT_MESSAGE.to_string(),
    };
    let commit = vcs.commit_all(&meta)?;
    if let Some(info) = &commit {
        info!(
            "event=history_init module=migration status=ok commit={}",
            info.id
        );
    }
    Ok(commit)
}

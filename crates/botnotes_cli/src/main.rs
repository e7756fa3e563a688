//! Admin entry point for a BotNotes data directory.
//!
//! # Responsibility
//! - Expose maintenance operations (status, migrate, rebuild, verify,
//!   export, import, clear) over the store resolved from the environment.
//! - Keep output line-oriented and deterministic for scripting.

use botnotes_core::archive::default_archive_name;
use botnotes_core::{
    core_version, init_from_config, ArchiveTransfer, ConflictPolicy, ImportMode, MigrationState,
    Migrator, NoteStore, StoreConfig,
};
use log::warn;
use std::path::PathBuf;
use std::process::ExitCode;

const USAGE: &str = "usage: botnotes <command>

commands:
  status                      data version, pending migration steps, index state
  migrate [--dry-run]         apply pending data migrations
  rebuild                     rebuild the search and backlink index
  verify                      check index consistency
  export [path]               write a tar.gz archive (default: ./notes-backup-<date>.tar.gz)
  import <path> [--replace|--skip]
                              import an archive; merge aborts on conflicts by default
  clear                       delete every note (history is kept)";

const ADMIN_AUTHOR: &str = "botnotes-admin";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), String> {
    let Some(command) = args.first() else {
        println!("{USAGE}");
        return Ok(());
    };
    if matches!(command.as_str(), "-h" | "--help" | "help") {
        println!("{USAGE}");
        return Ok(());
    }
    if command == "--version" {
        println!("botnotes {}", core_version());
        return Ok(());
    }

    let config = StoreConfig::from_env().map_err(|err| err.to_string())?;
    if let Err(err) = init_from_config(&config) {
        // File logging is optional for admin runs.
        eprintln!("warning: logging disabled: {err}");
    }
    let store = NoteStore::open(&config).map_err(|err| err.to_string())?;
    let rest = &args[1..];

    match command.as_str() {
        "status" => status(&store),
        "migrate" => migrate(&store, rest.iter().any(|arg| arg == "--dry-run")),
        "rebuild" => {
            let stats = store.rebuild_index().map_err(|err| err.to_string())?;
            println!("indexed={} epoch={}", stats.notes_indexed, stats.epoch);
            Ok(())
        }
        "verify" => {
            store.verify_index().map_err(|err| err.to_string())?;
            println!("index=ok");
            Ok(())
        }
        "export" => {
            let target = rest
                .first()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default_archive_name()));
            let report = ArchiveTransfer::new(&store)
                .export_to_path(&target)
                .map_err(|err| err.to_string())?;
            let written = report.path.unwrap_or(target);
            println!("exported={} path={}", report.note_count, written.display());
            Ok(())
        }
        "import" => import(&store, rest),
        "clear" => {
            let deleted = ArchiveTransfer::new(&store)
                .clear(ADMIN_AUTHOR)
                .map_err(|err| err.to_string())?;
            println!("deleted={deleted}");
            Ok(())
        }
        other => Err(format!("unknown command `{other}`\n\n{USAGE}")),
    }
}

fn status(store: &NoteStore) -> Result<(), String> {
    let mut migrator = Migrator::new(store);
    let version = migrator.detect().map_err(|err| err.to_string())?;
    let plan = migrator.plan().map_err(|err| err.to_string())?;
    println!("data_version={version}");
    println!("expected_version={}", plan.to);
    for step in &plan.steps {
        println!("pending_step={} {}", step.version, step.description);
    }
    println!("index_dirty={}", store.is_index_dirty());
    Ok(())
}

fn migrate(store: &NoteStore, dry_run: bool) -> Result<(), String> {
    let mut migrator = Migrator::new(store);
    migrator.detect().map_err(|err| err.to_string())?;
    let plan = migrator.plan().map_err(|err| err.to_string())?;
    if plan.is_empty() {
        println!("up_to_date version={}", plan.from);
        return Ok(());
    }
    for step in &plan.steps {
        println!("step={} {}", step.version, step.description);
    }
    if dry_run {
        return Ok(());
    }

    match migrator.apply(&plan, botnotes_core::migration::MIGRATION_AUTHOR) {
        Ok(report) => {
            for (old, new) in &report.moved {
                println!("moved {old} -> {new}");
            }
            println!(
                "migrated from={} to={} rewritten={} indexed={}",
                report.from,
                report.to,
                report.rewritten.len(),
                report.notes_indexed
            );
            Ok(())
        }
        Err(err) => {
            if let MigrationState::Aborted { version, .. } = migrator.state() {
                warn!("event=cli_migrate module=cli status=error version={version}");
            }
            Err(err.to_string())
        }
    }
}

fn import(store: &NoteStore, rest: &[String]) -> Result<(), String> {
    let Some(path) = rest.first() else {
        return Err(format!("import needs an archive path\n\n{USAGE}"));
    };
    let mode = if rest.iter().any(|arg| arg == "--replace") {
        ImportMode::Replace
    } else if rest.iter().any(|arg| arg == "--skip") {
        ImportMode::Merge {
            on_conflict: ConflictPolicy::Skip,
        }
    } else {
        ImportMode::Merge {
            on_conflict: ConflictPolicy::Abort,
        }
    };

    let file = std::fs::File::open(path).map_err(|err| format!("cannot open `{path}`: {err}"))?;
    let report = ArchiveTransfer::new(store)
        .import(std::io::BufReader::new(file), mode, ADMIN_AUTHOR)
        .map_err(|err| err.to_string())?;
    println!(
        "created={} skipped={} deleted={}",
        report.created.len(),
        report.skipped.len(),
        report.deleted
    );
    Ok(())
}

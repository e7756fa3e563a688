//! Git-backed version control adapter.
//!
//! # Responsibility
//! - Own the hidden `.git` directory inside the notes content root.
//! - Translate store commits into git commits with author and time.
//! - Serve per-path history, point-in-time reads and diffs.
//!
//! # Invariants
//! - Every commit is appended on top of `HEAD`; history stays linear.
//! - A repository handle is opened per call, so the adapter is `Sync`
//!   without sharing a `git2::Repository` across threads.

use super::{
    ChangeKind, CommitInfo, CommitMeta, PathChange, PathRevision, VcsError, VcsResult,
    VersionControl,
};
use git2::{
    Commit, DiffOptions, ErrorCode, IndexAddOption, Oid, Patch, Repository, Signature, Sort, Time,
};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

const AUTHOR_EMAIL: &str = "botnotes@local";
const UNKNOWN_AUTHOR: &str = "unknown";

/// Version control adapter over a git working directory.
#[derive(Debug, Clone)]
pub struct GitVersionControl {
    workdir: PathBuf,
}

impl GitVersionControl {
    /// Opens the repository at `workdir`, creating it when missing.
    ///
    /// Returns the adapter and whether a new repository was initialized.
    pub fn open_or_init(workdir: impl Into<PathBuf>) -> VcsResult<(Self, bool)> {
        let workdir = workdir.into();
        std::fs::create_dir_all(&workdir)?;

        let created = match Repository::open(&workdir) {
            Ok(_) => false,
            Err(_) => {
                Repository::init(&workdir)?;
                info!(
                    "event=vcs_init module=vcs status=ok workdir={}",
                    workdir.display()
                );
                true
            }
        };

        Ok((Self { workdir }, created))
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Commits every markdown file present in the working directory.
    ///
    /// Used once, when history is first enabled for an existing notes
    /// directory. Returns `None` when there is nothing to commit.
    pub fn commit_all(&self, meta: &CommitMeta) -> VcsResult<Option<CommitInfo>> {
        let repo = Repository::open(&self.workdir)?;
        let mut index = repo.index()?;
        index.add_all(["*.md"].iter(), IndexAddOption::DEFAULT, None)?;
        if index.is_empty() {
            return Ok(None);
        }
        index.write()?;
        let commit = write_commit(&repo, &mut index, meta)?;
        Ok(Some(commit_info(&commit)))
    }
}

impl GitVersionControl {
    /// Walks history from `HEAD`, keeping commits whose blob for `path`
    /// differs from the first parent's.
    fn walk_path(&self, path: &str, limit: Option<usize>) -> VcsResult<Vec<PathRevision>> {
        let repo = Repository::open(&self.workdir)?;
        let head = match repo.head() {
            Ok(head) => head.peel_to_commit()?,
            Err(_) => return Ok(Vec::new()),
        };

        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;
        walk.push(head.id())?;

        let mut entries = Vec::new();
        for oid in walk {
            let commit = repo.find_commit(oid?)?;
            let current = blob_id_at(&commit, path)?;
            let previous = match commit.parent(0) {
                Ok(parent) => blob_id_at(&parent, path)?,
                Err(_) => None,
            };
            if current != previous {
                entries.push(PathRevision {
                    commit: commit_info(&commit),
                    present: current.is_some(),
                });
                if limit.is_some_and(|limit| entries.len() >= limit) {
                    break;
                }
            }
        }

        Ok(entries)
    }
}

impl VersionControl for GitVersionControl {
    fn commit(&self, changes: &[PathChange], meta: &CommitMeta) -> VcsResult<CommitInfo> {
        let started_at = Instant::now();
        let result = (|| -> VcsResult<CommitInfo> {
            let repo = Repository::open(&self.workdir)?;
            let mut index = repo.index()?;
            // Stage on top of HEAD so leftovers from a failed commit never leak in.
            if let Ok(head) = repo.head() {
                index.read_tree(&head.peel_to_tree()?)?;
            }
            for change in changes {
                let path = Path::new(&change.path);
                match change.kind {
                    ChangeKind::Write => index.add_path(path)?,
                    ChangeKind::Remove => {
                        if index.get_path(path, 0).is_some() {
                            index.remove_path(path)?;
                        }
                    }
                }
            }
            let commit = write_commit(&repo, &mut index, meta)?;
            if let Err(err) = index.write() {
                warn!(
                    "event=vcs_index_write module=vcs status=error commit={} error={}",
                    commit.id(),
                    err
                );
            }
            Ok(commit_info(&commit))
        })();

        match &result {
            Ok(info) => info!(
                "event=vcs_commit module=vcs status=ok paths={} commit={} duration_ms={}",
                changes.len(),
                info.id,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=vcs_commit module=vcs status=error paths={} duration_ms={} error={}",
                changes.len(),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }

    fn head(&self) -> VcsResult<Option<String>> {
        let repo = Repository::open(&self.workdir)?;
        let reference = match repo.head() {
            Ok(reference) => reference,
            Err(err) if err.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let id = reference.peel_to_commit()?.id().to_string();
        Ok(Some(id))
    }

    fn history(&self, path: &str) -> VcsResult<Vec<PathRevision>> {
        self.walk_path(path, None)
    }

    fn latest(&self, path: &str) -> VcsResult<Option<PathRevision>> {
        Ok(self.walk_path(path, Some(1))?.into_iter().next())
    }

    fn read_at(&self, revision: &str, path: &str) -> VcsResult<Option<String>> {
        let repo = Repository::open(&self.workdir)?;
        let commit = find_commit(&repo, revision)?;
        let Some(blob_id) = blob_id_at(&commit, path)? else {
            return Ok(None);
        };
        let blob = repo.find_blob(blob_id)?;
        let text = String::from_utf8(blob.content().to_vec()).map_err(|_| {
            VcsError::InvalidData(format!("`{path}` at {revision} is not valid UTF-8"))
        })?;
        Ok(Some(text))
    }

    fn diff(&self, path: &str, from_revision: &str, to_revision: &str) -> VcsResult<String> {
        let old = self.read_at(from_revision, path)?.unwrap_or_default();
        let new = self.read_at(to_revision, path)?.unwrap_or_default();
        let file = Path::new(path);
        let mut options = DiffOptions::new();
        options.context_lines(3);
        let mut patch = Patch::from_buffers(
            old.as_bytes(),
            Some(file),
            new.as_bytes(),
            Some(file),
            Some(&mut options),
        )?;
        let buf = patch.to_buf()?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn write_commit<'r>(
    repo: &'r Repository,
    index: &mut git2::Index,
    meta: &CommitMeta,
) -> VcsResult<Commit<'r>> {
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let signature = signature_for(&meta.author, meta.timestamp_ms)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    let parents: Vec<&Commit<'_>> = parent.iter().collect();

    let commit_id = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &meta.message,
        &tree,
        &parents,
    )?;
    Ok(repo.find_commit(commit_id)?)
}

fn signature_for(author: &str, timestamp_ms: Option<i64>) -> VcsResult<Signature<'static>> {
    let name = sanitize_author(author);
    let signature = match timestamp_ms {
        Some(ms) => Signature::new(&name, AUTHOR_EMAIL, &Time::new(ms.div_euclid(1000), 0))?,
        None => Signature::now(&name, AUTHOR_EMAIL)?,
    };
    Ok(signature)
}

/// Git rejects angle brackets and newlines in identities.
fn sanitize_author(author: &str) -> String {
    let cleaned = author
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>') && !ch.is_control())
        .collect::<String>();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        UNKNOWN_AUTHOR.to_string()
    } else {
        trimmed.to_string()
    }
}

fn commit_info(commit: &Commit<'_>) -> CommitInfo {
    let author = commit.author();
    CommitInfo {
        id: commit.id().to_string(),
        author: author.name().unwrap_or(UNKNOWN_AUTHOR).to_string(),
        timestamp_ms: author.when().seconds() * 1000,
        message: commit.message().unwrap_or_default().trim_end().to_string(),
    }
}

fn find_commit<'r>(repo: &'r Repository, revision: &str) -> VcsResult<Commit<'r>> {
    let oid =
        Oid::from_str(revision).map_err(|_| VcsError::UnknownRevision(revision.to_string()))?;
    repo.find_commit(oid).map_err(|err| {
        if err.code() == ErrorCode::NotFound {
            VcsError::UnknownRevision(revision.to_string())
        } else {
            VcsError::Git(err)
        }
    })
}

fn blob_id_at(commit: &Commit<'_>, path: &str) -> VcsResult<Option<Oid>> {
    let tree = commit.tree()?;
    match tree.get_path(Path::new(path)) {
        Ok(entry) => Ok(Some(entry.id())),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

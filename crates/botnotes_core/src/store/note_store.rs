//! Note store service.
//!
//! # Responsibility
//! - Validate keys and tags, then apply note mutations as version
//!   controlled commits.
//! - Keep the index engine in step with every successful commit.
//! - Serve note reads, listings, history, diffs and index queries.
//!
//! # Invariants
//! - Lock order is rebuild gate (shared), key locks (sorted), commit lock.
//! - Files are staged and committed under the commit lock; a failed commit
//!   restores every staged file before the error is returned.
//! - Index update failures never fail a committed write; they are logged
//!   and mark the index dirty until the next rebuild.
//! - The index is trusted at open only when its synced head equals the
//!   history head and the data version is current.
//! - Every write bumps the note `sequence`, so history grows by exactly one
//!   revision per write.

use super::codec::{decode_note, encode_note, DecodedNote};
use super::layout::{read_optional, remove_file_pruning, write_atomic, StoreLayout};
use super::locks::KeyLocks;
use super::{now_ms, StoreError, StoreResult};
use crate::config::StoreConfig;
use crate::index::links::{extract_links, replace_link_target};
use crate::index::{Backlink, IndexEngine, IndexSnapshot, RebuildStats, SearchHit, SearchQuery};
use crate::migration::marker::{detect_version, write_marker};
use crate::migration::{initialize_history, CURRENT_DATA_VERSION};
use crate::model::note::{normalize_tag, normalize_tags, NewNote, Note, NoteKey, NoteUpdate};
use crate::model::revision::Revision;
use crate::vcs::{ChangeKind, CommitMeta, GitVersionControl, PathChange, VersionControl};
use log::{error, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Instant, UNIX_EPOCH};

/// Shortest accepted abbreviated revision id.
const MIN_REVISION_PREFIX: usize = 7;

/// Listing filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteFilter {
    /// Notes must carry every tag (compared after normalization).
    pub tags: Vec<String>,
    /// Folder key; matches the folder note itself and everything below it.
    pub prefix: Option<String>,
}

impl NoteFilter {
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            prefix: None,
        }
    }

    pub fn under(prefix: impl Into<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix: Some(prefix.into()),
        }
    }
}

/// Lazy iterator over a sorted key snapshot taken by [`NoteStore::list`].
///
/// Notes are read on demand; keys deleted after the snapshot are skipped.
pub struct NoteIter<'a> {
    store: &'a NoteStore,
    keys: Vec<NoteKey>,
    position: usize,
    tags: Vec<String>,
}

impl NoteIter<'_> {
    /// Rewinds to the first key of the snapshot.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Keys in the snapshot, before tag filtering.
    pub fn keys(&self) -> &[NoteKey] {
        &self.keys
    }
}

impl Iterator for NoteIter<'_> {
    type Item = StoreResult<Note>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(key) = self.keys.get(self.position) {
            self.position += 1;
            match self.store.load(key) {
                Ok(Some(note)) if note.has_all_tags(&self.tags) => return Some(Ok(note)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

struct StagedWrite {
    key: NoteKey,
    /// `None` removes the note.
    next: Option<Note>,
}

/// File snapshot taken before a staged write, used for rollback.
struct AppliedWrite {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

/// Version-controlled note store with a write-through index.
pub struct NoteStore {
    layout: StoreLayout,
    vcs: Box<dyn VersionControl>,
    index: IndexEngine,
    key_locks: KeyLocks,
    commit_lock: Mutex<()>,
    rebuild_gate: RwLock<()>,
    data_version: AtomicU32,
    index_dirty: AtomicBool,
}

impl NoteStore {
    /// Opens the store described by `config` with the git history backend.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        Self::open_layout(config.layout())
    }

    /// Opens a store at `layout`, initializing git history on first use.
    pub fn open_layout(layout: StoreLayout) -> StoreResult<Self> {
        let (vcs, created) = GitVersionControl::open_or_init(&layout.notes_dir)?;
        if created {
            initialize_history(&vcs)?;
        }
        Self::open_with(layout, Box::new(vcs))
    }

    /// Opens a store over an explicit history backend.
    ///
    /// # Errors
    /// - `UnsupportedVersion` when the data version marker is newer than
    ///   this build.
    /// - `InvalidData` when the marker is unreadable.
    pub fn open_with(layout: StoreLayout, vcs: Box<dyn VersionControl>) -> StoreResult<Self> {
        let started_at = Instant::now();
        std::fs::create_dir_all(&layout.notes_dir)?;

        let data_version = detect_version(&layout)?;
        if data_version > CURRENT_DATA_VERSION {
            error!(
                "event=store_open module=store status=error error_code=unsupported_version found={} supported={}",
                data_version, CURRENT_DATA_VERSION
            );
            return Err(StoreError::UnsupportedVersion {
                found: data_version,
                supported: CURRENT_DATA_VERSION,
            });
        }

        let index_existed = layout.index_path.exists();
        let (index, recreated) = IndexEngine::open_or_recreate(&layout.index_path)?;
        let head = vcs.head()?;
        let synced = index.synced_head()?;
        let stale = recreated || !index_existed || synced != head;
        if stale && index_existed && !recreated {
            warn!(
                "event=index_stale module=store status=detected synced={} head={}",
                synced.as_deref().unwrap_or("none"),
                head.as_deref().unwrap_or("none")
            );
        }
        let needs_rebuild = stale || data_version < CURRENT_DATA_VERSION;

        let store = Self {
            layout,
            vcs,
            index,
            key_locks: KeyLocks::default(),
            commit_lock: Mutex::new(()),
            rebuild_gate: RwLock::new(()),
            data_version: AtomicU32::new(data_version),
            index_dirty: AtomicBool::new(needs_rebuild),
        };

        // Older data stays dirty until its migration rebuilds the index.
        if needs_rebuild && data_version == CURRENT_DATA_VERSION {
            store.rebuild_unchecked()?;
        }

        info!(
            "event=store_open module=store status=ok data_version={} index_rebuilt={} duration_ms={}",
            data_version,
            needs_rebuild,
            started_at.elapsed().as_millis()
        );
        Ok(store)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Data version this store is currently at.
    pub fn data_version(&self) -> u32 {
        self.data_version.load(Ordering::Acquire)
    }

    /// Returns whether the index may lag the notes until the next rebuild.
    pub fn is_index_dirty(&self) -> bool {
        self.index_dirty.load(Ordering::Acquire)
    }

    /// Fails with `MigrationRequired` until the data version is current.
    pub fn ensure_ready(&self) -> StoreResult<()> {
        let found = self.data_version();
        if found < CURRENT_DATA_VERSION {
            return Err(StoreError::MigrationRequired {
                found,
                expected: CURRENT_DATA_VERSION,
            });
        }
        if found > CURRENT_DATA_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found,
                supported: CURRENT_DATA_VERSION,
            });
        }
        Ok(())
    }

    /// Creates a note and returns its key.
    ///
    /// The key is the sanitized explicit key, or a slug of the title.
    ///
    /// # Errors
    /// - `Conflict` when a note with the key exists.
    /// - `InvalidKey` / `InvalidTag` for malformed input.
    pub fn create(&self, new: NewNote, author: &str) -> StoreResult<NoteKey> {
        self.ensure_ready()?;
        self.create_unchecked(new, author)
    }

    pub fn read(&self, key: &str) -> StoreResult<Note> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        match self.load(&key)? {
            Some(note) => Ok(note),
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Applies a partial update; always records a new revision.
    pub fn update(&self, key: &str, update: NoteUpdate, author: &str) -> StoreResult<Revision> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        let tags = update.tags.as_deref().map(validate_tags).transpose()?;

        let _gate = self.rebuild_gate.read();
        let _guard = self.key_locks.lock(&key);
        let current = self.require(&key)?;

        let mut next = current.clone();
        if let Some(title) = update.title {
            next.title = resolve_title(&title, &key);
        }
        if let Some(content) = update.content {
            next.content = content;
        }
        if let Some(tags) = tags {
            next.tags = tags;
        }
        next.updated_at = now_ms();
        next.sequence = current.sequence + 1;

        let meta = commit_meta(author, None, format!("Update note '{key}'"));
        self.commit_staged(
            vec![StagedWrite {
                key: key.clone(),
                next: Some(next),
            }],
            meta,
            &key,
        )
    }

    /// Deletes a note, recording a tombstone revision. History is kept.
    pub fn delete(&self, key: &str, author: &str) -> StoreResult<Revision> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;

        let _gate = self.rebuild_gate.read();
        let _guard = self.key_locks.lock(&key);
        self.require(&key)?;

        let meta = commit_meta(author, None, format!("Delete note '{key}'"));
        self.commit_staged(
            vec![StagedWrite {
                key: key.clone(),
                next: None,
            }],
            meta,
            &key,
        )
    }

    /// Lists notes matching `filter` over a sorted key snapshot.
    pub fn list(&self, filter: &NoteFilter) -> StoreResult<NoteIter<'_>> {
        self.ensure_ready()?;
        let tags = validate_tags(&filter.tags)?;
        let prefix = filter.prefix.as_deref().map(NoteKey::parse).transpose()?;

        let keys = self
            .layout
            .scan_keys()?
            .into_iter()
            .filter(|key| {
                prefix
                    .as_ref()
                    .map_or(true, |prefix| key == prefix || key.is_under(prefix))
            })
            .collect();
        Ok(NoteIter {
            store: self,
            keys,
            position: 0,
            tags,
        })
    }

    pub fn list_keys(&self) -> StoreResult<Vec<NoteKey>> {
        self.ensure_ready()?;
        self.layout.scan_keys()
    }

    /// Direct children of `folder`; an empty folder lists top-level notes.
    pub fn list_folder(&self, folder: &str) -> StoreResult<Vec<NoteKey>> {
        self.ensure_ready()?;
        let folder = folder.trim().trim_matches('/');
        let wanted = if folder.is_empty() {
            None
        } else {
            Some(NoteKey::parse(folder)?)
        };

        Ok(self
            .layout
            .scan_keys()?
            .into_iter()
            .filter(|key| key.parent() == wanted.as_ref().map(NoteKey::as_str))
            .collect())
    }

    /// Tag usage counts across all notes.
    pub fn list_tags(&self) -> StoreResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for note in self.list(&NoteFilter::default())? {
            for tag in normalize_tags(&note?.tags) {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    pub fn find_by_tag(&self, tag: &str) -> StoreResult<Vec<Note>> {
        self.list(&NoteFilter::tagged([tag]))?.collect()
    }

    /// Revisions of `key`, newest first, including tombstones.
    ///
    /// # Errors
    /// - `NotFound` when the key never existed.
    pub fn history(&self, key: &str) -> StoreResult<Vec<Revision>> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        self.history_unchecked(&key)
    }

    /// Looks up one revision of `key` by full or abbreviated id.
    pub fn revision(&self, key: &str, revision: &str) -> StoreResult<Revision> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        self.find_revision(&key, revision)
    }

    /// Unified diff of the note file between two of its revisions.
    pub fn diff(&self, key: &str, from_revision: &str, to_revision: &str) -> StoreResult<String> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        let from = self.find_revision(&key, from_revision)?;
        let to = self.find_revision(&key, to_revision)?;
        Ok(self
            .vcs
            .diff(&StoreLayout::relative_path(&key), &from.id, &to.id)?)
    }

    /// Writes a new revision whose title, content and tags equal `revision`.
    ///
    /// Works for currently deleted keys as well.
    ///
    /// # Errors
    /// - `RevisionNotFound` when `revision` is not in the key's history.
    /// - `InvalidOperation` when `revision` is a tombstone.
    pub fn restore(&self, key: &str, revision: &str, author: &str) -> StoreResult<Revision> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        let target = self.find_revision(&key, revision)?;
        let Some(snapshot) = target.snapshot else {
            return Err(StoreError::InvalidOperation(format!(
                "revision {} of '{key}' is a deletion and cannot be restored",
                target.id
            )));
        };

        let _gate = self.rebuild_gate.read();
        let _guard = self.key_locks.lock(&key);
        let current = self.load(&key)?;

        let created_at = current
            .as_ref()
            .map_or(snapshot.created_at, |note| note.created_at);
        let sequence = current
            .as_ref()
            .map_or(snapshot.sequence, |note| note.sequence.max(snapshot.sequence))
            + 1;
        let next = Note {
            key: key.clone(),
            title: snapshot.title,
            content: snapshot.content,
            tags: snapshot.tags,
            created_at,
            updated_at: now_ms(),
            sequence,
        };

        let short_id = &target.id[..target.id.len().min(MIN_REVISION_PREFIX)];
        let meta = commit_meta(
            author,
            None,
            format!("Restore note '{key}' to {short_id}"),
        );
        self.commit_staged(
            vec![StagedWrite {
                key: key.clone(),
                next: Some(next),
            }],
            meta,
            &key,
        )
    }

    /// Renames a note and rewrites `[[old]]` references in linking notes,
    /// all in one commit.
    pub fn move_note(&self, key: &str, new_key: &str, author: &str) -> StoreResult<Revision> {
        self.ensure_ready()?;
        let old = NoteKey::parse(key)?;
        let new = NoteKey::parse(new_key)?;
        self.move_unchecked(&old, &new, author)
    }

    pub fn search(&self, query: &SearchQuery) -> StoreResult<Vec<SearchHit>> {
        self.ensure_ready()?;
        Ok(self.index.search(query)?)
    }

    /// Notes linking to `key`, sorted by source key. Works for keys that do
    /// not exist yet.
    pub fn backlinks(&self, key: &str) -> StoreResult<Vec<Backlink>> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        Ok(self.index.backlinks(&key)?)
    }

    pub fn outbound_links(&self, key: &str) -> StoreResult<Vec<NoteKey>> {
        self.ensure_ready()?;
        let key = NoteKey::parse(key)?;
        Ok(self.index.outbound_links(&key)?)
    }

    /// Rebuilds the index from the notes on disk. Writes issued meanwhile
    /// wait for the rebuild to finish.
    pub fn rebuild_index(&self) -> StoreResult<RebuildStats> {
        self.ensure_ready()?;
        self.rebuild_unchecked()
    }

    /// Runs the index consistency check.
    ///
    /// # Errors
    /// - `IndexCorruption` when the check fails; recover with a rebuild.
    pub fn verify_index(&self) -> StoreResult<()> {
        Ok(self.index.verify()?)
    }

    /// Canonical dump of the index content.
    pub fn index_snapshot(&self) -> StoreResult<IndexSnapshot> {
        Ok(self.index.snapshot()?)
    }

    pub(crate) fn create_unchecked(&self, new: NewNote, author: &str) -> StoreResult<NoteKey> {
        let (key, tags) = validate_new_note(&new)?;

        let _gate = self.rebuild_gate.read();
        let _guard = self.key_locks.lock(&key);
        if self.layout.note_path(&key).exists() {
            return Err(StoreError::Conflict(key));
        }

        let updated_at = new.updated_at.unwrap_or_else(now_ms);
        let note = Note {
            key: key.clone(),
            title: resolve_title(&new.title, &key),
            content: new.content,
            tags,
            created_at: new.created_at.unwrap_or(updated_at),
            updated_at,
            sequence: 1,
        };

        let meta = commit_meta(author, new.updated_at, format!("Create note '{key}'"));
        self.commit_staged(
            vec![StagedWrite {
                key: key.clone(),
                next: Some(note),
            }],
            meta,
            &key,
        )?;
        Ok(key)
    }

    pub(crate) fn move_unchecked(
        &self,
        old: &NoteKey,
        new: &NoteKey,
        author: &str,
    ) -> StoreResult<Revision> {
        if old == new {
            return Err(StoreError::InvalidOperation(format!(
                "cannot move '{old}' onto itself"
            )));
        }

        let _gate = self.rebuild_gate.read();
        let mut referrers = self.referrers(old, &[old, new])?;
        loop {
            let mut keys = vec![old.clone(), new.clone()];
            keys.extend(referrers.iter().cloned());
            let _guards = self.key_locks.lock_many(&keys);

            let staged = self.stage_move(old, new, &referrers)?;

            // No other write can commit while the commit lock is held, so
            // this set is final. Linking notes written since the first lookup
            // are not locked yet; release everything and take them too.
            let commit_guard = self.commit_lock.lock();
            let latest = self.referrers(old, &[old, new])?;
            if latest.iter().all(|source| keys.contains(source)) {
                let meta = commit_meta(author, None, format!("Move note '{old}' to '{new}'"));
                return self.commit_locked(commit_guard, staged, meta, new);
            }
            drop(commit_guard);
            info!(
                "event=note_move module=store status=retry key={} referrers={}",
                old,
                latest.len()
            );
            referrers = latest;
        }
    }

    /// Builds the writes of a move. Callers hold the key locks of `old`,
    /// `new` and every referrer.
    fn stage_move(
        &self,
        old: &NoteKey,
        new: &NoteKey,
        referrers: &[NoteKey],
    ) -> StoreResult<Vec<StagedWrite>> {
        let current = self.require(old)?;
        if self.layout.note_path(new).exists() {
            return Err(StoreError::Conflict(new.clone()));
        }

        let now = now_ms();
        let mut moved = current;
        moved.key = new.clone();
        moved.content = replace_link_target(&moved.content, old, new);
        moved.updated_at = now;
        moved.sequence += 1;

        let mut staged = vec![
            StagedWrite {
                key: old.clone(),
                next: None,
            },
            StagedWrite {
                key: new.clone(),
                next: Some(moved),
            },
        ];
        for source in referrers {
            let Some(mut note) = self.load(source)? else {
                continue;
            };
            let rewritten = replace_link_target(&note.content, old, new);
            if rewritten == note.content {
                continue;
            }
            note.content = rewritten;
            note.updated_at = now;
            note.sequence += 1;
            staged.push(StagedWrite {
                key: source.clone(),
                next: Some(note),
            });
        }
        Ok(staged)
    }

    /// Replaces a stored note as-is apart from its sequence.
    pub(crate) fn rewrite_unchecked(
        &self,
        note: Note,
        author: &str,
        message: String,
    ) -> StoreResult<Revision> {
        let key = note.key.clone();
        let _gate = self.rebuild_gate.read();
        let _guard = self.key_locks.lock(&key);
        let current = self.require(&key)?;

        let next = Note {
            sequence: current.sequence + 1,
            ..note
        };
        self.commit_staged(
            vec![StagedWrite {
                key: key.clone(),
                next: Some(next),
            }],
            commit_meta(author, None, message),
            &key,
        )
    }

    pub(crate) fn rebuild_unchecked(&self) -> StoreResult<RebuildStats> {
        let _gate = self.rebuild_gate.write();
        let head = self.vcs.head()?;

        let mut notes = Vec::new();
        for key in self.layout.scan_keys()? {
            match self.load(&key) {
                Ok(Some(note)) => notes.push(note),
                Ok(None) => {}
                Err(StoreError::InvalidData(reason)) => warn!(
                    "event=index_rebuild module=store status=skipped key={} reason={}",
                    key, reason
                ),
                Err(err) => return Err(err),
            }
        }

        let stats = self.index.rebuild(notes, head.as_deref())?;
        self.index_dirty.store(false, Ordering::Release);
        Ok(stats)
    }

    pub(crate) fn history_unchecked(&self, key: &NoteKey) -> StoreResult<Vec<Revision>> {
        let path = StoreLayout::relative_path(key);
        let entries = self.vcs.history(&path)?;
        if entries.is_empty() {
            return Err(StoreError::NotFound(key.clone()));
        }

        let mut revisions = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let snapshot = if entry.present {
                match self.vcs.read_at(&entry.commit.id, &path)? {
                    Some(text) => Some(decode_note(key, &text, entry.commit.timestamp_ms)?.note),
                    None => None,
                }
            } else {
                None
            };
            revisions.push(Revision {
                id: entry.commit.id.clone(),
                key: key.clone(),
                author: entry.commit.author.clone(),
                timestamp: entry.commit.timestamp_ms,
                message: entry.commit.message.clone(),
                parent: entries
                    .get(position + 1)
                    .map(|older| older.commit.id.clone()),
                snapshot,
            });
        }
        Ok(revisions)
    }

    /// Author of the most recent commit touching `key`.
    pub(crate) fn last_author(&self, key: &NoteKey) -> StoreResult<Option<String>> {
        Ok(self
            .vcs
            .latest(&StoreLayout::relative_path(key))?
            .map(|entry| entry.commit.author))
    }

    pub(crate) fn keys_unchecked(&self) -> StoreResult<Vec<NoteKey>> {
        self.layout.scan_keys()
    }

    /// Reads and decodes a note file without normalizing it.
    pub(crate) fn load_decoded(&self, key: &NoteKey) -> StoreResult<Option<DecodedNote>> {
        let path = self.layout.note_path(key);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| StoreError::InvalidData(format!("note '{key}' is not valid UTF-8")))?;
        decode_note(key, &text, modified_ms(&path)).map(Some)
    }

    /// Advances the data version marker on disk and in memory.
    pub(crate) fn set_data_version(&self, version: u32) -> StoreResult<()> {
        write_marker(&self.layout.marker_path, version)?;
        self.data_version.store(version, Ordering::Release);
        Ok(())
    }

    fn load(&self, key: &NoteKey) -> StoreResult<Option<Note>> {
        Ok(self.load_decoded(key)?.map(|decoded| decoded.note))
    }

    fn require(&self, key: &NoteKey) -> StoreResult<Note> {
        match self.load(key)? {
            Some(note) => Ok(note),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    fn find_revision(&self, key: &NoteKey, revision: &str) -> StoreResult<Revision> {
        let revision = revision.trim();
        let matches = |id: &str| {
            id == revision || (revision.len() >= MIN_REVISION_PREFIX && id.starts_with(revision))
        };
        self.history_unchecked(key)?
            .into_iter()
            .find(|candidate| matches(&candidate.id))
            .ok_or_else(|| StoreError::RevisionNotFound {
                key: key.clone(),
                revision: revision.to_string(),
            })
    }

    /// Keys of notes whose content links to `target`, minus `exclude`.
    ///
    /// Uses the index when it is clean and falls back to scanning notes.
    fn referrers(&self, target: &NoteKey, exclude: &[&NoteKey]) -> StoreResult<Vec<NoteKey>> {
        let indexed = if self.is_index_dirty() {
            None
        } else {
            match self.index.backlinks(target) {
                Ok(backlinks) => Some(backlinks.into_iter().map(|link| link.source).collect()),
                Err(err) => {
                    warn!(
                        "event=backlink_lookup module=store status=error key={} error={}",
                        target, err
                    );
                    None
                }
            }
        };

        let sources: Vec<NoteKey> = match indexed {
            Some(sources) => sources,
            None => {
                let mut sources = Vec::new();
                for key in self.layout.scan_keys()? {
                    let note = match self.load(&key) {
                        Ok(Some(note)) => note,
                        Ok(None) => continue,
                        Err(StoreError::InvalidData(reason)) => {
                            warn!(
                                "event=backlink_scan module=store status=skipped key={} reason={}",
                                key, reason
                            );
                            continue;
                        }
                        Err(err) => return Err(err),
                    };
                    if extract_links(&note.content)
                        .iter()
                        .any(|link| &link.target == target)
                    {
                        sources.push(key);
                    }
                }
                sources
            }
        };

        Ok(sources
            .into_iter()
            .filter(|source| !exclude.iter().any(|excluded| *excluded == source))
            .collect())
    }

    /// Stages files, commits them as one revision, then updates the index.
    ///
    /// The returned revision describes `primary`.
    fn commit_staged(
        &self,
        staged: Vec<StagedWrite>,
        meta: CommitMeta,
        primary: &NoteKey,
    ) -> StoreResult<Revision> {
        let commit_guard = self.commit_lock.lock();
        self.commit_locked(commit_guard, staged, meta, primary)
    }

    /// Commits while holding the commit lock. The index is updated before
    /// the lock is released, so index order matches history order.
    fn commit_locked(
        &self,
        commit_guard: MutexGuard<'_, ()>,
        staged: Vec<StagedWrite>,
        meta: CommitMeta,
        primary: &NoteKey,
    ) -> StoreResult<Revision> {
        let started_at = Instant::now();

        let parent = self
            .vcs
            .latest(&StoreLayout::relative_path(primary))?
            .map(|entry| entry.commit.id);

        let mut applied = Vec::with_capacity(staged.len());
        let mut changes = Vec::with_capacity(staged.len());
        if let Err(err) = self.stage_files(&staged, &mut applied, &mut changes) {
            self.rollback_files(&applied);
            error!(
                "event=note_write module=store status=error key={} error_code=stage_failed error={}",
                primary, err
            );
            return Err(err);
        }

        let info = match self.vcs.commit(&changes, &meta) {
            Ok(info) => info,
            Err(err) => {
                self.rollback_files(&applied);
                error!(
                    "event=note_write module=store status=error key={} error_code=commit_failed error={}",
                    primary, err
                );
                return Err(StoreError::VersionControl(err));
            }
        };
        let index_changes: Vec<(&NoteKey, Option<&Note>)> = staged
            .iter()
            .map(|write| (&write.key, write.next.as_ref()))
            .collect();
        self.update_index(&index_changes, &info.id, primary);
        drop(commit_guard);

        info!(
            "event=note_write module=store status=ok key={} paths={} commit={} duration_ms={}",
            primary,
            changes.len(),
            info.id,
            started_at.elapsed().as_millis()
        );

        let snapshot = staged
            .into_iter()
            .find(|write| &write.key == primary)
            .and_then(|write| write.next);
        Ok(Revision {
            id: info.id,
            key: primary.clone(),
            author: info.author,
            timestamp: info.timestamp_ms,
            message: info.message,
            parent,
            snapshot,
        })
    }

    fn stage_files(
        &self,
        staged: &[StagedWrite],
        applied: &mut Vec<AppliedWrite>,
        changes: &mut Vec<PathChange>,
    ) -> StoreResult<()> {
        for write in staged {
            let path = self.layout.note_path(&write.key);
            let previous = read_optional(&path)?;
            let kind = match &write.next {
                Some(note) => {
                    let text = encode_note(note)?;
                    write_atomic(&path, text.as_bytes())?;
                    ChangeKind::Write
                }
                None => {
                    remove_file_pruning(&path, &self.layout.notes_dir)?;
                    ChangeKind::Remove
                }
            };
            applied.push(AppliedWrite { path, previous });
            changes.push(PathChange {
                path: StoreLayout::relative_path(&write.key),
                kind,
            });
        }
        Ok(())
    }

    fn rollback_files(&self, applied: &[AppliedWrite]) {
        for write in applied.iter().rev() {
            let result = match &write.previous {
                Some(bytes) => write_atomic(&write.path, bytes),
                None => remove_file_pruning(&write.path, &self.layout.notes_dir),
            };
            if let Err(err) = result {
                error!(
                    "event=note_rollback module=store status=error path={} error={}",
                    write.path.display(),
                    err
                );
            }
        }
    }

    fn update_index(
        &self,
        changes: &[(&NoteKey, Option<&Note>)],
        head: &str,
        primary: &NoteKey,
    ) {
        // A dirty index must not claim to be synced with any commit.
        let head = if self.is_index_dirty() { None } else { Some(head) };
        if let Err(err) = self.index.apply(changes, head) {
            self.index_dirty.store(true, Ordering::Release);
            warn!(
                "event=index_update module=store status=error key={} paths={} error={}",
                primary,
                changes.len(),
                err
            );
        }
    }
}

fn commit_meta(author: &str, timestamp_ms: Option<i64>, message: String) -> CommitMeta {
    CommitMeta {
        author: author.to_string(),
        timestamp_ms,
        message,
    }
}

/// Checks `new` against the rules of `create` and returns its key and
/// normalized tags.
pub(crate) fn validate_new_note(new: &NewNote) -> StoreResult<(NoteKey, Vec<String>)> {
    let key = match new.key.as_deref() {
        Some(raw) => NoteKey::parse(raw)?,
        None => NoteKey::from_title(&new.title)?,
    };
    let tags = validate_tags(&new.tags)?;
    Ok((key, tags))
}

/// Rejects blank tags, then normalizes the set.
fn validate_tags(tags: &[String]) -> StoreResult<Vec<String>> {
    if let Some(blank) = tags.iter().find(|tag| normalize_tag(tag).is_none()) {
        return Err(StoreError::InvalidTag(blank.clone()));
    }
    Ok(normalize_tags(tags))
}

/// Blank titles fall back to the key stem; others are kept verbatim.
fn resolve_title(title: &str, key: &NoteKey) -> String {
    if title.trim().is_empty() {
        key.file_stem().to_string()
    } else {
        title.to_string()
    }
}

fn modified_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map_or_else(now_ms, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

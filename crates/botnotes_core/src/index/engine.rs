//! SQLite-backed index engine.
//!
//! # Responsibility
//! - Apply per-note incremental updates (postings, title, outbound links).
//! - Serve ranked search, backlinks and outbound link queries.
//! - Rebuild the whole index inside one transaction.
//!
//! # Invariants
//! - `update` is idempotent: it always deletes the key's rows before insert.
//! - Ranking is deterministic: `score DESC, note_key ASC`, where score is
//!   the sum of term frequencies of the matched query terms.
//! - A query matches a note only when every distinct query term occurs.
//! - File-backed engines read through a separate WAL connection, so readers
//!   observe either the pre- or post-rebuild state, never a partial one.
//! - The synced head names the history commit whose state the rows reflect.
//!   It is written in the same transaction as the rows; any write without a
//!   head clears it.

use super::links::extract_links;
use super::tokenize::{term_frequencies, tokenize};
use super::{is_corruption_error, IndexError, IndexResult};
use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::note::{Note, NoteKey};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const SEARCH_DEFAULT_LIMIT: u32 = 20;
pub const SEARCH_LIMIT_MAX: u32 = 100;

/// Search options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Free text, tokenized with the indexing tokenizer.
    pub text: String,
    /// Maximum hits to return; clamped to [`SEARCH_LIMIT_MAX`].
    pub limit: u32,
    /// Number of ranked hits to skip.
    pub offset: u32,
}

impl SearchQuery {
    /// Creates a query with default pagination.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: SEARCH_DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Single ranked search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub key: NoteKey,
    pub title: String,
    pub score: u64,
}

/// Inbound references from one source note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlink {
    pub source: NoteKey,
    /// Lines in the source note holding the reference, ascending, unique.
    pub line_numbers: Vec<u32>,
}

impl Backlink {
    pub fn link_count(&self) -> usize {
        self.line_numbers.len()
    }
}

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub notes_indexed: usize,
    pub epoch: u64,
}

/// Canonical, order-independent dump of the index content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// `(note_key, title, term_count)`
    pub documents: Vec<(String, String, i64)>,
    /// `(term, note_key, tf)`
    pub postings: Vec<(String, String, i64)>,
    /// `(source_key, target_key, line_number)`
    pub links: Vec<(String, String, i64)>,
}

/// Search and backlink index over a SQLite database.
pub struct IndexEngine {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl IndexEngine {
    /// Opens (and migrates) the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        let writer = open_db(path)?;
        let reader = open_db(path)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a private in-memory index.
    pub fn open_in_memory() -> IndexResult<Self> {
        Ok(Self {
            writer: Mutex::new(open_db_in_memory()?),
            reader: None,
            path: None,
        })
    }

    /// Opens the index at `path`, discarding it when it is corrupt or was
    /// written by a newer schema.
    ///
    /// Returns the engine and whether the index was recreated empty, in which
    /// case the caller must rebuild it.
    pub fn open_or_recreate(path: impl AsRef<Path>) -> IndexResult<(Self, bool)> {
        let path = path.as_ref();
        let attempt = Self::open(path).and_then(|engine| engine.verify().map(|()| engine));
        match attempt {
            Ok(engine) => Ok((engine, false)),
            Err(err) if is_recoverable(&err) => {
                warn!(
                    "event=index_recreate module=index status=start path={} reason={}",
                    path.display(),
                    err
                );
                remove_index_files(path)?;
                let engine = Self::open(path)?;
                Ok((engine, true))
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Recomputes (or, with `None`, removes) every index row for `key`.
    pub fn update(&self, key: &NoteKey, note: Option<&Note>) -> IndexResult<()> {
        self.apply(&[(key, note)], None)
    }

    /// Applies several per-key updates in one transaction and records
    /// `head` as the synced commit.
    pub fn apply(
        &self,
        changes: &[(&NoteKey, Option<&Note>)],
        head: Option<&str>,
    ) -> IndexResult<()> {
        for (key, note) in changes {
            if let Some(note) = note {
                if &note.key != *key {
                    return Err(IndexError::InvalidData(format!(
                        "note `{}` passed for key `{key}`",
                        note.key
                    )));
                }
            }
        }

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        for (key, note) in changes {
            remove_entries(&tx, key.as_str())?;
            if let Some(note) = note {
                insert_entries(&tx, note)?;
            }
        }
        bump_epoch(&tx)?;
        record_head(&tx, head)?;
        tx.commit()?;
        Ok(())
    }

    /// Commit id recorded by the last `apply` or `rebuild`.
    pub fn synced_head(&self) -> IndexResult<Option<String>> {
        let conn = self.writer.lock();
        let head = conn
            .query_row(
                "SELECT value FROM index_state WHERE name = 'head';",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(head)
    }

    /// Discards all rows and re-indexes `notes` in one transaction, then
    /// records `head` as the synced commit.
    pub fn rebuild<I>(&self, notes: I, head: Option<&str>) -> IndexResult<RebuildStats>
    where
        I: IntoIterator<Item = Note>,
    {
        let started_at = Instant::now();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM postings;
             DELETE FROM links;
             DELETE FROM documents;",
        )?;

        let mut notes_indexed = 0;
        for note in notes {
            insert_entries(&tx, &note)?;
            notes_indexed += 1;
        }
        let epoch = bump_epoch(&tx)?;
        record_head(&tx, head)?;
        tx.commit()?;

        info!(
            "event=index_rebuild module=index status=ok notes={} epoch={} duration_ms={}",
            notes_indexed,
            epoch,
            started_at.elapsed().as_millis()
        );
        Ok(RebuildStats {
            notes_indexed,
            epoch,
        })
    }

    /// Ranked keyword search. Blank queries and `limit == 0` return nothing.
    pub fn search(&self, query: &SearchQuery) -> IndexResult<Vec<SearchHit>> {
        let terms: BTreeSet<String> = tokenize(&query.text).into_iter().collect();
        if terms.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; terms.len()].join(", ");
        let sql = format!(
            "SELECT p.note_key AS note_key, d.title AS title, SUM(p.tf) AS score
             FROM postings p
             INNER JOIN documents d ON d.note_key = p.note_key
             WHERE p.term IN ({placeholders})
             GROUP BY p.note_key, d.title
             HAVING COUNT(*) = ?
             ORDER BY score DESC, p.note_key ASC
             LIMIT ? OFFSET ?"
        );
        let mut bind_values: Vec<Value> = terms.iter().cloned().map(Value::Text).collect();
        bind_values.push(Value::Integer(count_to_i64(terms.len())));
        bind_values.push(Value::Integer(i64::from(query.limit.min(SEARCH_LIMIT_MAX))));
        bind_values.push(Value::Integer(i64::from(query.offset)));

        let conn = self.read_conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let key_text: String = row.get("note_key")?;
            let score: i64 = row.get("score")?;
            hits.push(SearchHit {
                key: parse_key(&key_text)?,
                title: row.get("title")?,
                score: u64::try_from(score).unwrap_or_default(),
            });
        }
        Ok(hits)
    }

    /// Notes whose content references `key`, sorted by source key.
    pub fn backlinks(&self, key: &NoteKey) -> IndexResult<Vec<Backlink>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare_cached(
            "SELECT source_key, line_number
             FROM links
             WHERE target_key = ?1
             ORDER BY source_key ASC, line_number ASC;",
        )?;
        let mut rows = stmt.query([key.as_str()])?;
        let mut backlinks: Vec<Backlink> = Vec::new();
        while let Some(row) = rows.next()? {
            let source_text: String = row.get(0)?;
            let line_number: u32 = row.get(1)?;
            match backlinks.last_mut() {
                Some(last) if last.source.as_str() == source_text => {
                    last.line_numbers.push(line_number);
                }
                _ => backlinks.push(Backlink {
                    source: parse_key(&source_text)?,
                    line_numbers: vec![line_number],
                }),
            }
        }
        Ok(backlinks)
    }

    /// Distinct targets referenced by `key`, sorted.
    pub fn outbound_links(&self, key: &NoteKey) -> IndexResult<Vec<NoteKey>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT target_key FROM links WHERE source_key = ?1 ORDER BY target_key ASC;",
        )?;
        let mut rows = stmt.query([key.as_str()])?;
        let mut targets = Vec::new();
        while let Some(row) = rows.next()? {
            let target: String = row.get(0)?;
            targets.push(parse_key(&target)?);
        }
        Ok(targets)
    }

    /// Keys currently present in the index, sorted.
    pub fn indexed_keys(&self) -> IndexResult<Vec<NoteKey>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare("SELECT note_key FROM documents ORDER BY note_key ASC;")?;
        let mut rows = stmt.query([])?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            keys.push(parse_key(&key)?);
        }
        Ok(keys)
    }

    /// Generation counter, bumped by every update and rebuild.
    pub fn epoch(&self) -> IndexResult<u64> {
        let conn = self.writer.lock();
        let value: i64 = conn.query_row(
            "SELECT value FROM index_meta WHERE name = 'epoch';",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(value).unwrap_or_default())
    }

    /// Runs SQLite and cross-table consistency checks.
    pub fn verify(&self) -> IndexResult<()> {
        let conn = self.writer.lock();
        let status: String = conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0))?;
        if status != "ok" {
            return Err(IndexError::Corruption(format!("integrity_check: {status}")));
        }

        let checks = [
            (
                "postings reference unknown documents",
                "SELECT COUNT(*) FROM postings
                 WHERE note_key NOT IN (SELECT note_key FROM documents);",
            ),
            (
                "links reference unknown source documents",
                "SELECT COUNT(*) FROM links
                 WHERE source_key NOT IN (SELECT note_key FROM documents);",
            ),
            (
                "document term counts disagree with postings",
                "SELECT COUNT(*) FROM documents d
                 WHERE d.term_count != (
                    SELECT COALESCE(SUM(p.tf), 0) FROM postings p WHERE p.note_key = d.note_key
                 );",
            ),
            (
                "epoch marker missing",
                "SELECT CASE WHEN EXISTS(
                    SELECT 1 FROM index_meta WHERE name = 'epoch'
                 ) THEN 0 ELSE 1 END;",
            ),
        ];
        for (description, sql) in checks {
            let violations: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            if violations > 0 {
                return Err(IndexError::Corruption(format!(
                    "{description} ({violations})"
                )));
            }
        }
        Ok(())
    }

    /// Dumps documents, postings and links in canonical order.
    pub fn snapshot(&self) -> IndexResult<IndexSnapshot> {
        let conn = self.read_conn();
        Ok(IndexSnapshot {
            documents: dump_rows(
                &conn,
                "SELECT note_key, title, term_count FROM documents ORDER BY note_key;",
            )?,
            postings: dump_rows(
                &conn,
                "SELECT term, note_key, tf FROM postings ORDER BY term, note_key;",
            )?,
            links: dump_rows(
                &conn,
                "SELECT source_key, target_key, line_number FROM links
                 ORDER BY source_key, target_key, line_number;",
            )?,
        })
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        match &self.reader {
            Some(reader) => reader.lock(),
            None => self.writer.lock(),
        }
    }
}

fn insert_entries(tx: &Transaction<'_>, note: &Note) -> IndexResult<()> {
    let key = note.key.as_str();
    let frequencies = term_frequencies(&note.indexable_text());
    let term_count: u64 = frequencies.values().map(|tf| u64::from(*tf)).sum();

    tx.execute(
        "INSERT INTO documents (note_key, title, term_count) VALUES (?1, ?2, ?3);",
        params![key, note.title, i64::try_from(term_count).unwrap_or(i64::MAX)],
    )?;

    let mut posting_stmt =
        tx.prepare_cached("INSERT INTO postings (term, note_key, tf) VALUES (?1, ?2, ?3);")?;
    for (term, tf) in &frequencies {
        posting_stmt.execute(params![term, key, tf])?;
    }

    let mut link_stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO links (source_key, target_key, line_number) VALUES (?1, ?2, ?3);",
    )?;
    for link in extract_links(&note.content) {
        link_stmt.execute(params![key, link.target.as_str(), link.line_number])?;
    }
    Ok(())
}

fn remove_entries(tx: &Transaction<'_>, key: &str) -> IndexResult<()> {
    tx.execute("DELETE FROM postings WHERE note_key = ?1;", [key])?;
    tx.execute("DELETE FROM links WHERE source_key = ?1;", [key])?;
    tx.execute("DELETE FROM documents WHERE note_key = ?1;", [key])?;
    Ok(())
}

fn bump_epoch(tx: &Transaction<'_>) -> IndexResult<u64> {
    tx.execute(
        "INSERT INTO index_meta (name, value) VALUES ('epoch', 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1;",
        [],
    )?;
    let value: i64 = tx.query_row(
        "SELECT value FROM index_meta WHERE name = 'epoch';",
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(value).unwrap_or_default())
}

fn record_head(tx: &Transaction<'_>, head: Option<&str>) -> IndexResult<()> {
    match head {
        Some(head) => tx.execute(
            "INSERT INTO index_state (name, value) VALUES ('head', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value;",
            [head],
        )?,
        None => tx.execute("DELETE FROM index_state WHERE name = 'head';", [])?,
    };
    Ok(())
}

fn dump_rows(conn: &Connection, sql: &str) -> IndexResult<Vec<(String, String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_key(value: &str) -> IndexResult<NoteKey> {
    NoteKey::parse(value)
        .map_err(|_| IndexError::InvalidData(format!("invalid note key `{value}` in index")))
}

fn count_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_recoverable(err: &IndexError) -> bool {
    match err {
        IndexError::Corruption(_) => true,
        IndexError::Db(DbError::UnsupportedSchemaVersion { .. }) => true,
        IndexError::Db(DbError::Sqlite(inner)) => is_corruption_error(inner),
        _ => false,
    }
}

fn remove_index_files(path: &Path) -> IndexResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        match std::fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(IndexError::Db(DbError::Io(err))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{IndexEngine, SearchQuery};
    use crate::model::note::{Note, NoteKey};

    fn note(key: &str, title: &str, content: &str) -> Note {
        Note {
            key: NoteKey::parse(key).unwrap(),
            title: title.to_string(),
            content: content.to_string(),
            tags: Vec::new(),
            created_at: 0,
            updated_at: 0,
            sequence: 1,
        }
    }

    #[test]
    fn update_is_idempotent() {
        let engine = IndexEngine::open_in_memory().unwrap();
        let a = note("a", "Alpha", "rust rust [[b]]");
        engine.update(&a.key, Some(&a)).unwrap();
        let first = engine.snapshot().unwrap();
        engine.update(&a.key, Some(&a)).unwrap();
        assert_eq!(engine.snapshot().unwrap(), first);
    }

    #[test]
    fn search_ranks_by_term_frequency_then_key() {
        let engine = IndexEngine::open_in_memory().unwrap();
        for n in [
            note("b", "B", "rust"),
            note("a", "A", "rust"),
            note("c", "C", "rust rust rust"),
        ] {
            engine.update(&n.key, Some(&n)).unwrap();
        }
        let keys: Vec<_> = engine
            .search(&SearchQuery::new("RUST"))
            .unwrap()
            .into_iter()
            .map(|hit| hit.key.to_string())
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn search_requires_every_query_term() {
        let engine = IndexEngine::open_in_memory().unwrap();
        let a = note("a", "A", "rust guide");
        let b = note("b", "B", "rust only");
        engine.update(&a.key, Some(&a)).unwrap();
        engine.update(&b.key, Some(&b)).unwrap();
        let hits = engine.search(&SearchQuery::new("guide rust")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.as_str(), "a");
    }

    #[test]
    fn removing_a_note_prunes_backlinks() {
        let engine = IndexEngine::open_in_memory().unwrap();
        let a = note("a", "A", "[[target]]\n[[target|again]]");
        engine.update(&a.key, Some(&a)).unwrap();
        let target = NoteKey::parse("target").unwrap();
        let backlinks = engine.backlinks(&target).unwrap();
        assert_eq!(backlinks.len(), 1);
        assert_eq!(backlinks[0].line_numbers, vec![1, 2]);

        engine.update(&a.key, None).unwrap();
        assert!(engine.backlinks(&target).unwrap().is_empty());
        assert!(engine.indexed_keys().unwrap().is_empty());
    }

    #[test]
    fn apply_records_synced_head_and_update_clears_it() {
        let engine = IndexEngine::open_in_memory().unwrap();
        assert_eq!(engine.synced_head().unwrap(), None);

        let a = note("a", "A", "alpha [[b]]");
        let b = note("b", "B", "beta");
        engine
            .apply(&[(&a.key, Some(&a)), (&b.key, Some(&b))], Some("c1"))
            .unwrap();
        assert_eq!(engine.synced_head().unwrap().as_deref(), Some("c1"));
        assert_eq!(engine.indexed_keys().unwrap().len(), 2);

        engine.rebuild(vec![a.clone()], Some("c2")).unwrap();
        assert_eq!(engine.synced_head().unwrap().as_deref(), Some("c2"));

        engine.update(&a.key, None).unwrap();
        assert_eq!(engine.synced_head().unwrap(), None);
    }

    #[test]
    fn mismatched_note_key_leaves_index_untouched() {
        let engine = IndexEngine::open_in_memory().unwrap();
        let a = note("a", "A", "alpha");
        let b = note("b", "B", "beta");
        engine.apply(&[(&a.key, Some(&a))], Some("c1")).unwrap();

        let before = engine.snapshot().unwrap();
        assert!(engine
            .apply(&[(&b.key, Some(&b)), (&b.key, Some(&a))], Some("c2"))
            .is_err());
        assert_eq!(engine.snapshot().unwrap(), before);
        assert_eq!(engine.synced_head().unwrap().as_deref(), Some("c1"));
    }

    #[test]
    fn epoch_advances_on_every_update() {
        let engine = IndexEngine::open_in_memory().unwrap();
        let before = engine.epoch().unwrap();
        let a = note("a", "A", "x");
        engine.update(&a.key, Some(&a)).unwrap();
        engine.update(&a.key, None).unwrap();
        assert_eq!(engine.epoch().unwrap(), before + 2);
    }
}

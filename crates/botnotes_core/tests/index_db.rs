use botnotes_core::db::migrations::latest_version;
use botnotes_core::db::{open_db, open_db_in_memory, DbError};
use botnotes_core::index::IndexEngine;
use botnotes_core::model::note::{Note, NoteKey};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "documents");
    assert_table_exists(&conn, "postings");
    assert_table_exists(&conn, "links");
    assert_table_exists(&conn, "index_meta");
    assert_table_exists(&conn, "index_state");
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index").join("index.sqlite3");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "postings");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.sqlite3");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn newer_schema_index_is_recreated_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.sqlite3");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let (engine, recreated) = IndexEngine::open_or_recreate(&path).unwrap();
    assert!(recreated);
    assert!(engine.indexed_keys().unwrap().is_empty());
    engine.verify().unwrap();
}

#[test]
fn garbage_index_file_is_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.sqlite3");
    std::fs::write(&path, vec![0x5a_u8; 8192]).unwrap();

    let (engine, recreated) = IndexEngine::open_or_recreate(&path).unwrap();
    assert!(recreated);
    engine.verify().unwrap();
}

#[test]
fn orphan_postings_fail_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.sqlite3");
    let engine = IndexEngine::open(&path).unwrap();
    engine
        .update(
            &NoteKey::parse("a").unwrap(),
            Some(&Note {
                key: NoteKey::parse("a").unwrap(),
                title: "A".to_string(),
                content: "alpha".to_string(),
                tags: Vec::new(),
                created_at: 0,
                updated_at: 0,
                sequence: 1,
            }),
        )
        .unwrap();
    engine.verify().unwrap();

    let conn = Connection::open(&path).unwrap();
    conn.execute("DELETE FROM documents WHERE note_key = 'a';", [])
        .unwrap();
    drop(conn);

    let err = engine.verify().unwrap_err();
    assert!(err.to_string().contains("postings reference unknown documents"));
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "expected table `{table_name}` to exist");
}

use botnotes_core::archive::{read_archive, ARCHIVE_FORMAT};
use botnotes_core::{
    ArchiveTransfer, ConflictPolicy, ImportMode, NewNote, NoteFilter, NoteStore, StoreConfig,
    StoreError,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

fn open_store() -> (TempDir, NoteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = NoteStore::open(&StoreConfig::new(dir.path())).unwrap();
    (dir, store)
}

fn seeded_archive() -> Vec<u8> {
    let (_dir, store) = open_store();
    store
        .create(
            NewNote::new("Alpha", "alpha body\n[[beta]]")
                .with_key("projects/alpha")
                .with_tags(["work"]),
            "ann",
        )
        .unwrap();
    store
        .create(NewNote::new("Beta", "beta body").with_key("beta"), "bob")
        .unwrap();

    let mut bytes = Vec::new();
    let report = ArchiveTransfer::new(&store).export(&mut bytes).unwrap();
    assert_eq!(report.note_count, 2);
    bytes
}

fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn merge(on_conflict: ConflictPolicy) -> ImportMode {
    ImportMode::Merge { on_conflict }
}

#[test]
fn export_writes_manifest_and_sorted_records() {
    let bytes = seeded_archive();
    let contents = read_archive(bytes.as_slice()).unwrap();

    assert_eq!(contents.manifest.format, ARCHIVE_FORMAT);
    assert_eq!(contents.manifest.note_count, 2);
    assert!(chrono::DateTime::parse_from_rfc3339(&contents.manifest.exported_at).is_ok());

    let keys: Vec<&str> = contents
        .records
        .iter()
        .map(|record| record.key.as_str())
        .collect();
    assert_eq!(keys, vec!["beta", "projects/alpha"]);
    assert_eq!(contents.records[0].author, "bob");
    assert_eq!(contents.records[1].tags, vec!["work"]);
}

#[test]
fn import_into_empty_store_recreates_notes() {
    let bytes = seeded_archive();
    let original = read_archive(bytes.as_slice()).unwrap();
    let (_dir, store) = open_store();

    let report = ArchiveTransfer::new(&store)
        .import(bytes.as_slice(), ImportMode::Replace, "importer")
        .unwrap();
    assert_eq!(report.created.len(), 2);
    assert_eq!(report.deleted, 0);

    for record in &original.records {
        let note = store.read(record.key.as_str()).unwrap();
        assert_eq!(note.title, record.title);
        assert_eq!(note.content, record.content);
        assert_eq!(note.tags, record.tags);
        assert_eq!(note.created_at, record.created_at);
        assert_eq!(note.updated_at, record.updated_at);

        let history = store.history(record.key.as_str()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, record.author);
    }

    let backlinks = store.backlinks("beta").unwrap();
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source.as_str(), "projects/alpha");
}

#[test]
fn replace_deletes_existing_notes_first() {
    let bytes = seeded_archive();
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Local", "local only").with_key("local"), "ann")
        .unwrap();
    store
        .create(NewNote::new("Beta", "local beta").with_key("beta"), "ann")
        .unwrap();

    let report = ArchiveTransfer::new(&store)
        .import(bytes.as_slice(), ImportMode::Replace, "importer")
        .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.created.len(), 2);

    let keys: Vec<String> = store
        .list_keys()
        .unwrap()
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(keys, vec!["beta", "projects/alpha"]);
    assert_eq!(store.read("beta").unwrap().content, "beta body");
    assert!(store.history("local").unwrap()[0].is_tombstone());
}

#[test]
fn merge_abort_rejects_conflicts_before_writing() {
    let bytes = seeded_archive();
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Beta", "local beta").with_key("beta"), "ann")
        .unwrap();

    let err = ArchiveTransfer::new(&store)
        .import(bytes.as_slice(), merge(ConflictPolicy::Abort), "importer")
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(key) if key.as_str() == "beta"));

    assert!(matches!(
        store.read("projects/alpha").unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert_eq!(store.read("beta").unwrap().content, "local beta");
}

#[test]
fn merge_skip_keeps_existing_notes() {
    let bytes = seeded_archive();
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Beta", "local beta").with_key("beta"), "ann")
        .unwrap();

    let report = ArchiveTransfer::new(&store)
        .import(bytes.as_slice(), merge(ConflictPolicy::Skip), "importer")
        .unwrap();
    let skipped: Vec<&str> = report.skipped.iter().map(|key| key.as_str()).collect();
    let created: Vec<&str> = report.created.iter().map(|key| key.as_str()).collect();
    assert_eq!(skipped, vec!["beta"]);
    assert_eq!(created, vec!["projects/alpha"]);
    assert_eq!(store.read("beta").unwrap().content, "local beta");
}

#[test]
fn export_to_directory_uses_dated_name() {
    let (_dir, store) = open_store();
    store.create(NewNote::new("Only", "x"), "ann").unwrap();
    let out = tempfile::tempdir().unwrap();

    let report = ArchiveTransfer::new(&store)
        .export_to_path(out.path())
        .unwrap();
    let path = report.path.unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("notes-backup-"));
    assert!(name.ends_with(".tar.gz"));

    let file = std::fs::File::open(&path).unwrap();
    assert_eq!(read_archive(file).unwrap().records.len(), 1);
}

#[test]
fn clear_deletes_every_note_and_keeps_history() {
    let (_dir, store) = open_store();
    store.create(NewNote::new("A", "a").with_key("a"), "ann").unwrap();
    store.create(NewNote::new("B", "b").with_key("x/b"), "ann").unwrap();

    let deleted = ArchiveTransfer::new(&store).clear("admin").unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.list(&NoteFilter::default()).unwrap().count(), 0);

    let history = store.history("x/b").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].author, "admin");
}

#[test]
fn replace_with_invalid_record_keeps_existing_notes() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Local", "local only").with_key("local"), "ann")
        .unwrap();
    let manifest = format!(
        r#"{{"format":"{ARCHIVE_FORMAT}","version":1,"exported_at":"2024-01-01T00:00:00Z","note_count":2}}"#
    );
    let good = br#"{"key":"good","title":"Good","content":"fine","tags":[],"author":"ann","created_at":1000,"updated_at":1000}"#;
    let bad = br#"{"key":"bad","title":"Bad","content":"x","tags":[" "],"author":"ann","created_at":1000,"updated_at":1000}"#;
    let bytes = build_archive(&[
        ("manifest.json", manifest.as_bytes()),
        ("notes/bad.json", &bad[..]),
        ("notes/good.json", &good[..]),
    ]);

    let err = ArchiveTransfer::new(&store)
        .import(bytes.as_slice(), ImportMode::Replace, "importer")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTag(_)));

    assert_eq!(store.read("local").unwrap().content, "local only");
    assert_eq!(store.history("local").unwrap().len(), 1);
    assert!(matches!(
        store.read("good").unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[test]
fn titles_survive_export_and_import_verbatim() {
    let (_dir, source) = open_store();
    source
        .create(NewNote::new("  Spaced title ", "body").with_key("spaced"), "ann")
        .unwrap();
    let mut bytes = Vec::new();
    ArchiveTransfer::new(&source).export(&mut bytes).unwrap();

    let (_other, target) = open_store();
    ArchiveTransfer::new(&target)
        .import(bytes.as_slice(), ImportMode::Replace, "importer")
        .unwrap();
    assert_eq!(target.read("spaced").unwrap().title, "  Spaced title ");
}

#[test]
fn foreign_archive_format_is_rejected() {
    let manifest = br#"{"format":"other","version":1,"exported_at":"2024-01-01T00:00:00Z","note_count":0}"#;
    let bytes = build_archive(&[("manifest.json", &manifest[..])]);

    let err = read_archive(bytes.as_slice()).unwrap_err();
    assert!(matches!(err, StoreError::Archive(message) if message.contains("other")));
}

#[test]
fn archive_without_manifest_is_rejected() {
    let bytes = build_archive(&[]);

    let err = read_archive(bytes.as_slice()).unwrap_err();
    assert!(matches!(err, StoreError::Archive(_)));
}

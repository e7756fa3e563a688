use botnotes_core::{NewNote, NoteFilter, NoteStore, NoteUpdate, StoreConfig, StoreError};
use tempfile::TempDir;

fn open_store() -> (TempDir, NoteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = NoteStore::open(&StoreConfig::new(dir.path())).unwrap();
    (dir, store)
}

#[test]
fn create_then_read_returns_normalized_note() {
    let (_dir, store) = open_store();

    let key = store
        .create(
            NewNote::new("Rust Tips", "Use `?` everywhere.").with_tags(["Rust", " tips ", "rust"]),
            "ann",
        )
        .unwrap();
    assert_eq!(key.as_str(), "rust-tips");

    let note = store.read("rust-tips").unwrap();
    assert_eq!(note.title, "Rust Tips");
    assert_eq!(note.content, "Use `?` everywhere.");
    assert_eq!(note.tags, vec!["rust", "tips"]);
    assert_eq!(note.created_at, note.updated_at);
    assert!(store.layout().notes_dir.join("rust-tips.md").is_file());
}

#[test]
fn explicit_keys_are_sanitized_and_nested() {
    let (_dir, store) = open_store();
    let key = store
        .create(NewNote::new("Alpha", "a").with_key(" /projects/alpha/ "), "ann")
        .unwrap();
    assert_eq!(key.as_str(), "projects/alpha");
    assert!(store
        .layout()
        .notes_dir
        .join("projects")
        .join("alpha.md")
        .is_file());

    let err = store
        .create(NewNote::new("Escape", "x").with_key("../outside"), "ann")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey(_)));
}

#[test]
fn duplicate_create_is_conflict() {
    let (_dir, store) = open_store();
    store.create(NewNote::new("Same", "one"), "ann").unwrap();
    let err = store.create(NewNote::new("Same", "two"), "bob").unwrap_err();
    assert!(matches!(err, StoreError::Conflict(key) if key.as_str() == "same"));
    assert_eq!(store.read("same").unwrap().content, "one");
}

#[test]
fn blank_tag_is_rejected() {
    let (_dir, store) = open_store();
    let err = store
        .create(NewNote::new("Tagged", "x").with_tags(["ok", "   "]), "ann")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTag(_)));
    assert!(matches!(
        store.read("tagged").unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[test]
fn update_changes_only_given_fields() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Plan", "draft").with_tags(["work"]), "ann")
        .unwrap();

    let revision = store
        .update("plan", NoteUpdate::content("final"), "bob")
        .unwrap();
    assert_eq!(revision.author, "bob");
    assert!(revision.parent.is_some());

    let note = store.read("plan").unwrap();
    assert_eq!(note.title, "Plan");
    assert_eq!(note.content, "final");
    assert_eq!(note.tags, vec!["work"]);
    assert_eq!(revision.snapshot.as_ref(), Some(&note));
}

#[test]
fn update_and_delete_of_missing_note_are_not_found() {
    let (_dir, store) = open_store();
    assert!(matches!(
        store.update("ghost", NoteUpdate::content("x"), "ann").unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert!(matches!(
        store.delete("ghost", "ann").unwrap_err(),
        StoreError::NotFound(_)
    ));
}

#[test]
fn delete_removes_file_and_prunes_empty_folders() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Deep", "x").with_key("a/b/deep"), "ann")
        .unwrap();

    let revision = store.delete("a/b/deep", "ann").unwrap();
    assert!(revision.is_tombstone());
    assert!(matches!(
        store.read("a/b/deep").unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert!(!store.layout().notes_dir.join("a").exists());
}

#[test]
fn list_filters_by_every_tag_and_prefix() {
    let (_dir, store) = open_store();
    for (key, tags) in [
        ("projects", vec!["work"]),
        ("projects/alpha", vec!["work", "rust"]),
        ("projects/beta", vec!["work"]),
        ("journal", vec!["rust"]),
    ] {
        store
            .create(NewNote::new(key, "body").with_key(key).with_tags(tags), "ann")
            .unwrap();
    }

    let keys = |filter: NoteFilter| -> Vec<String> {
        store
            .list(&filter)
            .unwrap()
            .map(|note| note.unwrap().key.into())
            .collect()
    };

    assert_eq!(
        keys(NoteFilter::default()),
        vec!["journal", "projects", "projects/alpha", "projects/beta"]
    );
    assert_eq!(
        keys(NoteFilter::tagged(["WORK", "rust"])),
        vec!["projects/alpha"]
    );
    assert_eq!(
        keys(NoteFilter::under("projects")),
        vec!["projects", "projects/alpha", "projects/beta"]
    );
}

#[test]
fn note_iter_restarts_from_snapshot() {
    let (_dir, store) = open_store();
    store.create(NewNote::new("One", "1"), "ann").unwrap();
    store.create(NewNote::new("Two", "2"), "ann").unwrap();

    let mut iter = store.list(&NoteFilter::default()).unwrap();
    assert_eq!(iter.by_ref().count(), 2);
    assert!(iter.next().is_none());
    iter.restart();
    assert_eq!(iter.count(), 2);
}

#[test]
fn folder_listing_and_tag_queries() {
    let (_dir, store) = open_store();
    for (key, tags) in [
        ("inbox", vec!["todo"]),
        ("work/a", vec!["todo", "work"]),
        ("work/b", vec!["work"]),
        ("work/deep/c", vec![]),
    ] {
        store
            .create(NewNote::new(key, "x").with_key(key).with_tags(tags), "ann")
            .unwrap();
    }

    let names = |keys: Vec<botnotes_core::NoteKey>| -> Vec<String> {
        keys.into_iter().map(String::from).collect()
    };
    assert_eq!(names(store.list_folder("").unwrap()), vec!["inbox"]);
    assert_eq!(names(store.list_folder("work").unwrap()), vec!["work/a", "work/b"]);

    let tags = store.list_tags().unwrap();
    assert_eq!(tags.get("todo"), Some(&2));
    assert_eq!(tags.get("work"), Some(&2));

    let todo: Vec<String> = store
        .find_by_tag("TODO")
        .unwrap()
        .into_iter()
        .map(|note| note.key.into())
        .collect();
    assert_eq!(todo, vec!["inbox", "work/a"]);
}

#[test]
fn move_renames_note_and_rewrites_references() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Old", "original body").with_key("old"), "ann")
        .unwrap();
    store
        .create(
            NewNote::new("Ref", "see [[old]] and [[old|the old one]]").with_key("ref"),
            "ann",
        )
        .unwrap();

    let revision = store.move_note("old", "archive/new", "bob").unwrap();
    assert_eq!(revision.key.as_str(), "archive/new");

    assert!(matches!(
        store.read("old").unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert_eq!(store.read("archive/new").unwrap().content, "original body");
    assert_eq!(
        store.read("ref").unwrap().content,
        "see [[archive/new]] and [[archive/new|the old one]]"
    );

    assert!(store.backlinks("old").unwrap().is_empty());
    let backlinks = store.backlinks("archive/new").unwrap();
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source.as_str(), "ref");
    assert_eq!(backlinks[0].link_count(), 1);
}

#[test]
fn move_onto_existing_key_is_conflict() {
    let (_dir, store) = open_store();
    store.create(NewNote::new("A", "a").with_key("a"), "ann").unwrap();
    store.create(NewNote::new("B", "b").with_key("b"), "ann").unwrap();

    let err = store.move_note("a", "b", "ann").unwrap_err();
    assert!(matches!(err, StoreError::Conflict(key) if key.as_str() == "b"));
    assert_eq!(store.read("a").unwrap().content, "a");
}

#[test]
fn reopened_store_keeps_notes_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path());
    {
        let store = NoteStore::open(&config).unwrap();
        store
            .create(NewNote::new("Persistent", "durable words"), "ann")
            .unwrap();
    }

    let store = NoteStore::open(&config).unwrap();
    assert_eq!(store.read("persistent").unwrap().content, "durable words");
    let hits = store
        .search(&botnotes_core::SearchQuery::new("durable"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(!store.is_index_dirty());
}

#[test]
fn deleted_index_is_rebuilt_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path());
    {
        let store = NoteStore::open(&config).unwrap();
        store.create(NewNote::new("Kept", "needle"), "ann").unwrap();
    }
    std::fs::remove_dir_all(dir.path().join("index")).unwrap();

    let store = NoteStore::open(&config).unwrap();
    let hits = store
        .search(&botnotes_core::SearchQuery::new("needle"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key.as_str(), "kept");
}

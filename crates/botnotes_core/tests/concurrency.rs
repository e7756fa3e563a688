use botnotes_core::{NewNote, NoteStore, NoteUpdate, SearchQuery, StoreConfig};
use std::collections::HashMap;
use std::thread;
use tempfile::TempDir;

const WRITES_PER_THREAD: usize = 5;

fn open_store() -> (TempDir, NoteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = NoteStore::open(&StoreConfig::new(dir.path())).unwrap();
    (dir, store)
}

/// Position of every commit counted from `HEAD` (0 is newest).
fn commit_positions(store: &NoteStore) -> HashMap<String, usize> {
    let repo = git2::Repository::open(&store.layout().notes_dir).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.set_sorting(git2::Sort::TOPOLOGICAL).unwrap();
    walk.push_head().unwrap();
    walk.enumerate()
        .map(|(position, oid)| (oid.unwrap().to_string(), position))
        .collect()
}

#[test]
fn concurrent_updates_to_one_key_each_get_a_revision() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Shared", "start").with_key("shared"), "ann")
        .unwrap();

    thread::scope(|scope| {
        for worker in 0..2 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..WRITES_PER_THREAD {
                    let body = format!("worker{worker} round{round}");
                    store
                        .update("shared", NoteUpdate::content(body), &format!("w{worker}"))
                        .unwrap();
                }
            });
        }
    });

    let history = store.history("shared").unwrap();
    assert_eq!(history.len(), 1 + 2 * WRITES_PER_THREAD);

    let note = store.read("shared").unwrap();
    assert_eq!(note.sequence, 1 + 2 * WRITES_PER_THREAD as u64);
    assert_eq!(history[0].snapshot.as_ref(), Some(&note));

    let hits = store.search(&SearchQuery::new(&note.content)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key.as_str(), "shared");
    assert!(store
        .search(&SearchQuery::new("start"))
        .unwrap()
        .is_empty());
    assert!(!store.is_index_dirty());
}

#[test]
fn concurrent_creates_of_distinct_keys_all_land() {
    let (_dir, store) = open_store();

    thread::scope(|scope| {
        for worker in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..WRITES_PER_THREAD {
                    let key = format!("w{worker}/n{round}");
                    store
                        .create(NewNote::new(&key, "payload").with_key(&key), "ann")
                        .unwrap();
                }
            });
        }
    });

    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 4 * WRITES_PER_THREAD);
    for key in &keys {
        assert_eq!(store.history(key.as_str()).unwrap().len(), 1);
    }
    assert_eq!(
        store.search(&SearchQuery::new("payload")).unwrap().len(),
        4 * WRITES_PER_THREAD
    );
}

#[test]
fn rebuild_during_writes_leaves_a_consistent_index() {
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Seed", "seed").with_key("seed"), "ann")
        .unwrap();

    thread::scope(|scope| {
        let writer = &store;
        scope.spawn(move || {
            for round in 0..WRITES_PER_THREAD {
                writer
                    .create(
                        NewNote::new("Note", format!("links to [[seed]] {round}"))
                            .with_key(format!("note{round}")),
                        "ann",
                    )
                    .unwrap();
            }
        });
        let rebuilder = &store;
        scope.spawn(move || {
            for _ in 0..3 {
                rebuilder.rebuild_index().unwrap();
            }
        });
    });

    store.verify_index().unwrap();
    let live = store.index_snapshot().unwrap();
    store.rebuild_index().unwrap();
    assert_eq!(store.index_snapshot().unwrap(), live);
    assert_eq!(store.backlinks("seed").unwrap().len(), WRITES_PER_THREAD);
}

#[test]
fn move_rewrites_every_link_committed_before_it() {
    const LINKERS: usize = 20;
    let (_dir, store) = open_store();
    store
        .create(NewNote::new("Old", "target").with_key("old"), "ann")
        .unwrap();

    thread::scope(|scope| {
        let writer = &store;
        scope.spawn(move || {
            for round in 0..LINKERS {
                writer
                    .create(
                        NewNote::new("Linker", "see [[old]]").with_key(format!("linker{round}")),
                        "ann",
                    )
                    .unwrap();
            }
        });
        let mover = &store;
        scope.spawn(move || {
            while mover.list_keys().unwrap().len() < 3 {
                thread::yield_now();
            }
            mover.move_note("old", "new", "ann").unwrap();
        });
    });

    let positions = commit_positions(&store);
    let moved_at = positions[&store.history("new").unwrap()[0].id];
    let mut rewritten = 0;
    for round in 0..LINKERS {
        let key = format!("linker{round}");
        let history = store.history(&key).unwrap();
        let created_at = positions[&history.last().unwrap().id];
        let content = store.read(&key).unwrap().content;
        if created_at > moved_at {
            assert_eq!(content, "see [[new]]", "{key} was committed before the move");
            rewritten += 1;
        } else {
            assert_eq!(content, "see [[old]]", "{key} was committed after the move");
        }
    }

    assert_eq!(store.backlinks("new").unwrap().len(), rewritten);
    assert_eq!(store.backlinks("old").unwrap().len(), LINKERS - rewritten);
    let live = store.index_snapshot().unwrap();
    store.rebuild_index().unwrap();
    assert_eq!(store.index_snapshot().unwrap(), live);
}

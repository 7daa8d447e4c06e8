//! End-to-end facade tests over a real on-disk store

use openmemory_core::{AddInput, ListFilter, MemoryEngine, QueryFilters};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> MemoryEngine {
    MemoryEngine::with_defaults(Some(dir.path().join("e2e.db"))).unwrap()
}

#[test]
fn full_memory_lifecycle() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    // Add
    let added = engine.add(AddInput::new("The quick brown fox")).unwrap();
    assert_eq!(added.chunks, 1);

    // Query finds it with a meaningful score
    let matches = engine.query("quick fox", 5, &QueryFilters::default()).unwrap();
    assert_eq!(matches[0].id, added.id);
    assert!(matches[0].score > 0.3);

    // Get round-trips content and sectors
    let memory = engine.get(&added.id, None).unwrap();
    assert_eq!(memory.content, "The quick brown fox");

    // Reinforce boosts multiplicatively
    let before = memory.salience;
    let reinforced = engine.reinforce(&added.id, 0.2).unwrap();
    assert!(reinforced.salience > before);

    // Delete, then nothing ever returns it again
    engine.delete(&added.id).unwrap();
    assert_eq!(engine.get(&added.id, None).unwrap_err().code(), "not_found");
    let matches = engine.query("quick fox", 5, &QueryFilters::default()).unwrap();
    assert!(matches.iter().all(|m| m.id != added.id));
}

#[test]
fn empty_store_queries_cleanly() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let matches = engine
        .query("anything whatsoever", 8, &QueryFilters::default())
        .unwrap();
    assert!(matches.is_empty());
}

#[test]
fn duplicate_writes_collapse() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let first = engine.add(AddInput::new("Meeting with Alice at 3pm")).unwrap();
    let second = engine.add(AddInput::new("Meeting with Alice at 3pm")).unwrap();

    assert_eq!(first.id, second.id);
    assert!(second.deduplicated);
    assert_eq!(engine.list(&ListFilter::default(), 10, 0).unwrap().len(), 1);
}

#[test]
fn coactivation_feeds_propagation() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let a = engine
        .add(AddInput::new("compile errors from the borrow checker"))
        .unwrap()
        .id;
    let b = engine
        .add(AddInput::new("lifetime errors from the borrow checker"))
        .unwrap()
        .id;

    // Retrieving both together records associative edges
    let matches = engine
        .query("borrow checker errors", 5, &QueryFilters::default())
        .unwrap();
    assert_eq!(matches.len(), 2);

    // Propagating from one now reaches the other
    let outcome = engine.propagate(&a, 0.5, None).unwrap();
    assert!(outcome.updated_ids.contains(&b));
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id = {
        let engine = open_engine(&dir);
        engine
            .add(AddInput::new("persistent fact about the moon"))
            .unwrap()
            .id
    };

    let engine = open_engine(&dir);
    let memory = engine.get(&id, None).unwrap();
    assert_eq!(memory.content, "persistent fact about the moon");

    let matches = engine
        .query("fact about the moon", 5, &QueryFilters::default())
        .unwrap();
    assert_eq!(matches[0].id, id);
}

#[test]
fn snapshot_reflects_store_state() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let mut input = AddInput::new("snapshot me");
    input.user_id = Some("u-snap".to_string());
    engine.add(input).unwrap();

    let snapshot = engine.snapshot().unwrap();
    assert_eq!(snapshot["memories"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["users"][0]["id"], "u-snap");
}

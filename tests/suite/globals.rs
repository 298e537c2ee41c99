//! Global store change notification and snapshots.

use std::sync::{Arc, Mutex};

use serde_json::json;

use tessera_globals::{GlobalStore, GlobalsError};
use tessera_types::{ChangeAction, GlobalChange, TypeTag};

fn recording_store() -> (GlobalStore, Arc<Mutex<Vec<GlobalChange>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut store = GlobalStore::new();
    let sink = Arc::clone(&seen);
    store.subscribe(Box::new(move |change: &GlobalChange| {
        sink.lock().unwrap().push(change.clone());
    }));
    (store, seen)
}

#[test]
fn equal_value_is_not_a_change() {
    let (mut store, seen) = recording_store();
    store
        .add_global("filters", TypeTag::Json, json!({ "a": [1, 2] }))
        .unwrap();
    store.set_clean();
    seen.lock().unwrap().clear();

    store.set("filters", json!({ "a": [1, 2] })).unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert!(!store.is_dirty());

    store.set("filters", json!({ "a": [1, 3] })).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(store.is_dirty());
}

#[test]
fn rename_moves_the_value() {
    let (mut store, seen) = recording_store();
    store.add_global("x", TypeTag::Integer, json!(5)).unwrap();
    store.rename_global("x", "y").unwrap();

    assert_eq!(store.get("y").unwrap(), &json!(5));
    assert_eq!(store.get("x"), Err(GlobalsError::NotFound("x".to_string())));

    let changes = seen.lock().unwrap();
    let last = changes.last().unwrap();
    assert_eq!(last.action, ChangeAction::Rename);
    assert_eq!(last.old_name.as_deref(), Some("x"));
}

#[test]
fn failed_cast_degrades_to_null() {
    let (mut store, seen) = recording_store();
    store
        .add_global("label", TypeTag::String, json!("north"))
        .unwrap();
    store.change_type("label", TypeTag::Number).unwrap();

    assert_eq!(store.get("label").unwrap(), &json!(null));
    assert_eq!(store.get_type("label").unwrap(), TypeTag::Number);
    let changes = seen.lock().unwrap();
    let last = changes.last().unwrap();
    assert_eq!(last.action, ChangeAction::Cast);
    assert_eq!(last.old_value, Some(json!("north")));
}

#[test]
fn snapshot_skips_unknown_names() {
    let mut store = GlobalStore::new();
    store.add_global("year", TypeTag::Integer, json!("2024")).unwrap();

    let snapshot = store.snapshot(&["year", "missing"]);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["year"].type_tag, TypeTag::Integer);
    assert_eq!(snapshot["year"].value, json!(2024));
}

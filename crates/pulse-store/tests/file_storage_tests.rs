//! Durability of the file backend across process restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pulse_core::{ClientMeta, EventKind, EventPayload, QueueConfig, QueuedEvent};
use pulse_store::{FileStorage, IdentityStore, JsonStore, PersistentEventQueue, Storage};

fn event(id: &str, kind: EventKind) -> QueuedEvent {
    QueuedEvent::with_id(
        id,
        "visits",
        EventPayload::new(kind).with_topic("focus"),
        &ClientMeta::default(),
        Utc::now(),
    )
}

fn open_queue(dir: &std::path::Path) -> PersistentEventQueue {
    let storage = Arc::new(FileStorage::open(dir).expect("open storage"));
    PersistentEventQueue::open(JsonStore::new(storage), &QueueConfig::default())
}

#[test]
fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let queue = open_queue(dir.path());
        queue.enqueue(event("e_1", EventKind::NewTip)).unwrap();
        queue.enqueue(event("e_2", EventKind::CopyTip)).unwrap();
        queue.remove_by_ids(&["e_1".to_string()]).unwrap();
    }

    let queue = open_queue(dir.path());
    let pending = queue.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "e_2");
    assert_eq!(pending[0].kind, EventKind::CopyTip);
    assert_eq!(pending[0].topic.as_deref(), Some("focus"));
}

#[test]
fn no_temp_files_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();
    storage.set("sb_visitor_id_v1:visits", "\"tok.abc1234567890123\"").unwrap();
    storage.set("sb_visitor_id_v1:visits", "\"tok.def1234567890123\"").unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["sb_visitor_id_v1%3Avisits.json".to_string()]);
    assert_eq!(
        storage.get("sb_visitor_id_v1:visits").unwrap().as_deref(),
        Some("\"tok.def1234567890123\"")
    );
}

#[test]
fn missing_key_and_remove_are_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path().join("nested")).unwrap();
    assert_eq!(storage.get("absent").unwrap(), None);
    storage.remove("absent").unwrap();
}

#[test]
fn identity_persists_per_subject() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = Arc::new(FileStorage::open(dir.path()).unwrap());
        let identities = IdentityStore::new(JsonStore::new(storage));
        identities.set("Visits", "tok.abc1234567890123").unwrap();
    }
    let storage = Arc::new(FileStorage::open(dir.path()).unwrap());
    let identities = IdentityStore::new(JsonStore::new(storage));
    assert_eq!(
        identities.signed("visits").map(|t| t.expose().to_string()),
        Some("tok.abc1234567890123".to_string())
    );
    assert!(identities.signed("other").is_none());
}

#[tokio::test(start_paused = true)]
async fn coalesced_writes_reach_disk_after_delay() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::open(dir.path()).unwrap());
    let store = JsonStore::new(storage.clone());

    store
        .set_throttled("sb_prefs_v1", &serde_json::json!({"sound": false}), Duration::from_millis(350))
        .unwrap();
    assert_eq!(storage.get("sb_prefs_v1").unwrap(), None);

    tokio::time::sleep(Duration::from_millis(400)).await;
    tokio::task::yield_now().await;
    assert_eq!(
        storage.get("sb_prefs_v1").unwrap().as_deref(),
        Some("{\"sound\":false}")
    );
}

//! Durable, ordered, id-idempotent outbound event queue.
//!
//! Entries are kept in enqueue order and never reordered. Every mutation is
//! written through to storage before it returns, so a restart right after
//! `enqueue` still sees the event. Growth is bounded: past `capacity` the
//! oldest entries are evicted.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use pulse_core::{QueueConfig, QueuedEvent};

use crate::{JsonStore, StoreResult};

/// Persistent FIFO of [`QueuedEvent`]s awaiting delivery.
pub struct PersistentEventQueue {
    store: JsonStore,
    key: String,
    capacity: usize,
    events: Mutex<Vec<QueuedEvent>>,
}

impl fmt::Debug for PersistentEventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentEventQueue")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl PersistentEventQueue {
    /// Open the queue, loading whatever was persisted under `config.storage_key`.
    ///
    /// Corrupt persisted data is logged and treated as an empty queue.
    #[must_use]
    pub fn open(store: JsonStore, config: &QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        let mut events: Vec<QueuedEvent> = store.get(&config.storage_key).unwrap_or_default();
        if events.len() > capacity {
            let excess = events.len() - capacity;
            events.drain(..excess);
        }
        tracing::debug!(
            key = %config.storage_key,
            pending = events.len(),
            "event queue loaded"
        );
        Self {
            store,
            key: config.storage_key.clone(),
            capacity,
            events: Mutex::new(events),
        }
    }

    /// Maximum number of retained events.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event and persist.
    ///
    /// Returns `Ok(false)` without touching storage when an event with the same
    /// id is already queued.
    ///
    /// # Errors
    /// Returns an error if persisting fails; the event stays queued in memory.
    pub fn enqueue(&self, event: QueuedEvent) -> StoreResult<bool> {
        let mut events = self.events.lock();
        if events.iter().any(|e| e.id == event.id) {
            tracing::debug!(event_id = %event.id, "duplicate event id ignored");
            return Ok(false);
        }
        events.push(event);
        if events.len() > self.capacity {
            let excess = events.len() - self.capacity;
            let evicted: Vec<String> = events.drain(..excess).map(|e| e.id).collect();
            tracing::warn!(
                evicted = evicted.len(),
                capacity = self.capacity,
                "event queue full, evicted oldest"
            );
        }
        self.persist(&events)?;
        Ok(true)
    }

    /// Oldest `n` events, not removed.
    #[must_use]
    pub fn peek_batch(&self, n: usize) -> Vec<QueuedEvent> {
        self.events.lock().iter().take(n).cloned().collect()
    }

    /// Remove events by id. Unknown ids are ignored.
    ///
    /// Returns how many events were removed.
    ///
    /// # Errors
    /// Returns an error if persisting fails.
    pub fn remove_by_ids(&self, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|e| !wanted.contains(e.id.as_str()));
        let removed = before - events.len();
        if removed > 0 {
            self.persist(&events)?;
        }
        Ok(removed)
    }

    /// Increment the attempt counter of the given events. Order is untouched.
    ///
    /// # Errors
    /// Returns an error if persisting fails.
    pub fn bump_attempts(&self, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut events = self.events.lock();
        let mut touched = false;
        for event in events.iter_mut() {
            if wanted.contains(event.id.as_str()) {
                event.attempt_count = event.attempt_count.saturating_add(1);
                touched = true;
            }
        }
        if touched {
            self.persist(&events)?;
        }
        Ok(())
    }

    /// Whether an event with this id is queued.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.events.lock().iter().any(|e| e.id == id)
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Copy of every queued event, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedEvent> {
        self.events.lock().clone()
    }

    fn persist(&self, events: &[QueuedEvent]) -> StoreResult<()> {
        self.store.set(&self.key, &events).inspect_err(|e| {
            tracing::error!(key = %self.key, error = %e, "failed to persist event queue");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::MemoryStorage;
    use crate::storage::Storage;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use pulse_core::{ClientMeta, EventKind, EventPayload};

    fn event(id: &str) -> QueuedEvent {
        QueuedEvent::with_id(
            id,
            "visits",
            EventPayload::new(EventKind::NewTip),
            &ClientMeta::default(),
            Utc::now(),
        )
    }

    fn ids(events: &[QueuedEvent]) -> Vec<String> {
        events.iter().map(|e| e.id.clone()).collect()
    }

    fn open(storage: &Arc<MemoryStorage>, capacity: usize) -> PersistentEventQueue {
        let store = JsonStore::new(storage.clone());
        PersistentEventQueue::open(store, &QueueConfig::default().with_capacity(capacity))
    }

    #[test]
    fn enqueue_preserves_order() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = open(&storage, 10);
        for id in ["a", "b", "c"] {
            assert!(queue.enqueue(event(id)).unwrap());
        }
        assert_eq!(ids(&queue.peek_batch(2)), vec!["a", "b"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn duplicate_id_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = open(&storage, 10);
        assert!(queue.enqueue(event("a")).unwrap());
        let writes = storage.write_count();
        assert!(!queue.enqueue(event("a")).unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(storage.write_count(), writes);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = open(&storage, 3);
        for id in ["a", "b", "c", "d", "e"] {
            queue.enqueue(event(id)).unwrap();
        }
        assert_eq!(ids(&queue.snapshot()), vec!["c", "d", "e"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = open(&storage, 10);
        for id in ["a", "b", "c"] {
            queue.enqueue(event(id)).unwrap();
        }
        assert_eq!(queue.remove_by_ids(&["b".into()]).unwrap(), 1);
        assert_eq!(queue.remove_by_ids(&["b".into(), "zz".into()]).unwrap(), 0);
        assert_eq!(ids(&queue.snapshot()), vec!["a", "c"]);
        assert!(!queue.contains("b"));
    }

    #[test]
    fn bump_attempts_keeps_order() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = open(&storage, 10);
        for id in ["a", "b", "c"] {
            queue.enqueue(event(id)).unwrap();
        }
        queue.bump_attempts(&["b".into()]).unwrap();
        queue.bump_attempts(&["b".into(), "c".into()]).unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(ids(&snapshot), vec!["a", "b", "c"]);
        let attempts: Vec<u32> = snapshot.iter().map(|e| e.attempt_count).collect();
        assert_eq!(attempts, vec![0, 2, 1]);
    }

    #[test]
    fn survives_reopen() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let queue = open(&storage, 10);
            queue.enqueue(event("a")).unwrap();
            queue.enqueue(event("b")).unwrap();
            queue.bump_attempts(&["a".into()]).unwrap();
        }
        let reopened = open(&storage, 10);
        let snapshot = reopened.snapshot();
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert_eq!(snapshot[0].attempt_count, 1);
    }

    #[test]
    fn corrupt_storage_opens_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("sb_pending_events_v1", "[{\"id\":").unwrap();
        let queue = open(&storage, 10);
        assert!(queue.is_empty());
        queue.enqueue(event("a")).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reopen_with_smaller_capacity_keeps_newest() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let queue = open(&storage, 10);
            for id in ["a", "b", "c", "d"] {
                queue.enqueue(event(id)).unwrap();
            }
        }
        let reopened = open(&storage, 2);
        assert_eq!(ids(&reopened.snapshot()), vec!["c", "d"]);
    }
}

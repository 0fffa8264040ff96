//! JSON mirror over a [`Storage`] with a per-key write coalescer.
//!
//! Reads are served from an in-memory mirror after the first load. Writes are
//! either immediate ([`JsonStore::set`]) or coalesced
//! ([`JsonStore::set_throttled`]): the newest serialized value per key waits in
//! a pending map and a single timer per key persists it once the delay
//! elapses. Later `set_throttled` calls within the window only replace the
//! pending value.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{Storage, StoreResult};

/// Coalesced writes never fire sooner than this.
pub const MIN_COALESCE_DELAY: Duration = Duration::from_millis(80);

struct Inner {
    storage: Arc<dyn Storage>,
    mirror: Mutex<HashMap<String, Value>>,
    pending: Mutex<HashMap<String, String>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Inner {
    /// Persist the pending value for `key`, if any.
    fn write_pending(&self, key: &str) {
        let Some(raw) = self.pending.lock().remove(key) else {
            return;
        };
        if let Err(e) = self.storage.set(key, &raw) {
            tracing::warn!(key, error = %e, "coalesced write failed");
        }
    }
}

/// Cheaply cloneable handle; clones share the mirror and pending writes.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStore")
            .field("mirrored", &self.inner.mirror.lock().len())
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl JsonStore {
    /// Wrap a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                mirror: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Read and decode a key.
    ///
    /// Missing keys, unreadable storage and corrupt JSON all yield `None`;
    /// failures are logged, never surfaced.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let cached = self.inner.mirror.lock().get(key).cloned();
        let value = match cached {
            Some(value) => value,
            None => {
                let raw = match self.inner.storage.get(key) {
                    Ok(Some(raw)) => raw,
                    Ok(None) => return None,
                    Err(e) => {
                        tracing::warn!(key, error = %e, "storage read failed");
                        return None;
                    }
                };
                let value: Value = match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(key, error = %e, "discarding corrupt stored value");
                        return None;
                    }
                };
                self.inner
                    .mirror
                    .lock()
                    .insert(key.to_string(), value.clone());
                value
            }
        };

        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key, error = %e, "stored value has unexpected shape");
                None
            }
        }
    }

    /// Encode and persist immediately.
    ///
    /// Any coalesced write still pending for `key` is superseded.
    ///
    /// # Errors
    /// Returns an error if serialization or the storage write fails; the
    /// mirror is updated either way.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        let raw = serde_json::to_string(&value)?;
        self.inner.mirror.lock().insert(key.to_string(), value);
        self.inner.pending.lock().remove(key);
        if let Some(timer) = self.inner.timers.lock().remove(key) {
            timer.abort();
        }
        self.inner.storage.set(key, &raw)
    }

    /// Encode now, persist after `delay` (at least [`MIN_COALESCE_DELAY`]).
    ///
    /// Outside a Tokio runtime the write happens immediately.
    ///
    /// # Errors
    /// Returns an error if serialization fails, or if the immediate fallback
    /// write fails.
    pub fn set_throttled<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        delay: Duration,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(value)?;
        let raw = serde_json::to_string(&value)?;
        self.inner.mirror.lock().insert(key.to_string(), value);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.pending.lock().remove(key);
            return self.inner.storage.set(key, &raw);
        };

        self.inner.pending.lock().insert(key.to_string(), raw);

        let mut timers = self.inner.timers.lock();
        if timers.get(key).is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let delay = delay.max(MIN_COALESCE_DELAY);
        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.timers.lock().remove(&owned_key);
            inner.write_pending(&owned_key);
        });
        timers.insert(key.to_string(), timer);
        Ok(())
    }

    /// Persist every pending coalesced write now.
    pub fn flush_pending(&self) {
        let timers: Vec<(String, JoinHandle<()>)> = self.inner.timers.lock().drain().collect();
        for (_, timer) in timers {
            timer.abort();
        }
        let keys: Vec<String> = self.inner.pending.lock().keys().cloned().collect();
        for key in keys {
            self.inner.write_pending(&key);
        }
    }

    /// Number of keys with a pending coalesced write.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Delete a key from the mirror, the pending map and storage.
    ///
    /// # Errors
    /// Returns an error if the storage delete fails.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        self.inner.mirror.lock().remove(key);
        self.inner.pending.lock().remove(key);
        if let Some(timer) = self.inner.timers.lock().remove(key) {
            timer.abort();
        }
        self.inner.storage.remove(key)
    }

    /// Drop the mirrored value so the next read goes to storage.
    ///
    /// Used when another process may have written the key.
    pub fn invalidate(&self, key: &str) {
        self.inner.mirror.lock().remove(key);
    }
}

//! Correlation registry for out-of-band resolutions.
//!
//! Maps an id to a pending one-shot resolver. Used for delegated tool calls
//! (resolved by a client's tool response) and plan approvals (resolved by a
//! human decision). One instance is constructed at startup and injected
//! wherever it is needed.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub struct CorrelationMap<T> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> CorrelationMap<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending resolution. A previous entry under the same id is
    /// dropped, which wakes its waiter with a closed-channel error.
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.into(), tx);
        rx
    }

    /// Resolve a pending entry. Returns `false` if the id is unknown, already
    /// resolved, removed after a timeout, or its waiter has gone away.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let sender = self.lock().remove(id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry so any later resolution is discarded.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for CorrelationMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

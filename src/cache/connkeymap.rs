use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Reverse map from a connection's client id to the keys it fetched.
///
/// The server associates tracked keys with the connection that read
/// them; once that connection dies the association is gone, so those
/// entries can no longer be cached safely. This map makes the scoped
/// purge possible.
pub(crate) struct ConnKeyMap {
    inner: Mutex<HashMap<i64, HashSet<String>>>,
}

impl ConnKeyMap {
    pub(crate) fn new() -> ConnKeyMap {
        ConnKeyMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, conn_id: i64, key: &str) {
        self.inner
            .lock()
            .unwrap()
            .entry(conn_id)
            .or_default()
            .insert(key.to_string());
    }

    pub(crate) fn del(&self, conn_id: i64, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(keys) = inner.get_mut(&conn_id) {
            keys.remove(key);
            if keys.is_empty() {
                inner.remove(&conn_id);
            }
        }
    }

    /// Removes and returns every key associated with `conn_id`.
    pub(crate) fn take_keys(&self, conn_id: i64) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .remove(&conn_id)
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

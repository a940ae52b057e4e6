//! An in-memory shared store with per-context handles

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ContextId, Storage, StorageEvent, StorageEvents, StorageNotice};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug)]
struct Shared {
    entries: Mutex<HashMap<String, String>>,
    notices: broadcast::Sender<StorageNotice>,
    next_context: AtomicU64,
}

/// A store shared by any number of execution contexts
///
/// The store itself is not a [`Storage`]; each context obtains its own
/// handle through [`SharedStorage::context()`], so that mutations can be
/// attributed and announced only to the other contexts.
#[derive(Clone, Debug)]
pub struct SharedStorage {
    shared: Arc<Shared>,
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorage {
    /// Constructs a new, empty shared store
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                notices,
                next_context: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a handle for a new execution context
    pub fn context(&self) -> ContextStorage {
        let id = ContextId(self.shared.next_context.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(context = id.0, "opened storage context");
        ContextStorage {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

/// One execution context's handle onto a [`SharedStorage`]
#[derive(Clone, Debug)]
pub struct ContextStorage {
    shared: Arc<Shared>,
    id: ContextId,
}

impl ContextStorage {
    /// The identity under which this handle's mutations are announced
    pub fn id(&self) -> ContextId {
        self.id
    }

    fn announce(&self, key: &str, new_value: Option<String>) {
        let notice = StorageNotice {
            origin: self.id,
            event: StorageEvent {
                key: Some(key.to_owned()),
                new_value,
            },
        };

        // No receivers is not an error; nobody is listening yet.
        let _ = self.shared.notices.send(notice);
    }
}

impl Storage for ContextStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.shared.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let previous = self
            .shared
            .entries
            .lock()
            .insert(key.to_owned(), value.to_owned());

        if previous.as_deref() != Some(value) {
            self.announce(key, Some(value.to_owned()));
        }
    }

    fn remove(&self, key: &str) {
        let previous = self.shared.entries.lock().remove(key);

        if previous.is_some() {
            self.announce(key, None);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.shared.entries.lock().keys().cloned().collect()
    }

    fn subscribe(&self) -> StorageEvents {
        StorageEvents::new(self.shared.notices.subscribe(), self.id)
    }

    fn replace_if(&self, key: &str, expected: Option<&str>, value: &str) -> bool {
        let replaced = {
            let mut entries = self.shared.entries.lock();
            if entries.get(key).map(String::as_str) == expected {
                entries.insert(key.to_owned(), value.to_owned());
                true
            } else {
                false
            }
        };

        if replaced && expected != Some(value) {
            self.announce(key, Some(value.to_owned()));
        }

        replaced
    }

    fn remove_if(&self, key: &str, expected: &str) -> bool {
        let removed = {
            let mut entries = self.shared.entries.lock();
            if entries.get(key).map(String::as_str) == Some(expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        };

        if removed {
            self.announce(key, None);
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn contexts_share_values() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();

        a.set("k", "v");
        assert_eq!(b.get("k").as_deref(), Some("v"));

        b.remove("k");
        assert_eq!(a.get("k"), None);
    }

    #[tokio::test]
    async fn other_contexts_are_notified() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();
        let mut events = b.subscribe();

        a.set("k", "v");
        a.remove("k");

        let first = events.recv().await.unwrap();
        assert_eq!(first.key.as_deref(), Some("k"));
        assert_eq!(first.new_value.as_deref(), Some("v"));

        let second = events.recv().await.unwrap();
        assert_eq!(second.key.as_deref(), Some("k"));
        assert_eq!(second.new_value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn own_mutations_are_not_echoed() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let mut events = a.subscribe();

        a.set("k", "v");

        let echoed = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(echoed.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_values_are_not_announced() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();

        a.set("k", "v");
        let mut events = b.subscribe();
        a.set("k", "v");
        a.remove("missing");

        let announced = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(announced.is_err());
    }

    #[test]
    fn insert_if_absent_does_not_overwrite() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();

        assert!(a.insert_if_absent("k", "first"));
        assert!(!b.insert_if_absent("k", "second"));
        assert_eq!(b.get("k").as_deref(), Some("first"));
    }

    #[test]
    fn replace_if_compares_the_current_value() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();
        a.set("k", "old");

        assert!(!b.replace_if("k", Some("stale"), "new"));
        assert_eq!(a.get("k").as_deref(), Some("old"));

        assert!(b.replace_if("k", Some("old"), "new"));
        assert_eq!(a.get("k").as_deref(), Some("new"));

        assert!(!a.replace_if("missing", Some("old"), "new"));
        assert!(a.replace_if("missing", None, "new"));
    }

    #[test]
    fn remove_if_compares_the_current_value() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();
        a.set("k", "fresh");

        assert!(!b.remove_if("k", "stale"));
        assert_eq!(a.get("k").as_deref(), Some("fresh"));

        assert!(b.remove_if("k", "fresh"));
        assert_eq!(a.get("k"), None);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_to_resync() {
        let shared = SharedStorage::new();
        let a = shared.context();
        let b = shared.context();
        let mut events = b.subscribe();

        for i in 0..(NOTICE_CAPACITY + 10) {
            a.set("k", &i.to_string());
        }

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, None);
        assert!(event.affects("k"));
    }
}

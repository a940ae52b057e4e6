//! Shared key/value storage observed by every execution context
//!
//! A [`Storage`] is one context's handle onto a store shared with other
//! contexts. Mutations made through one handle are announced to every
//! *other* handle through a [`StorageEvents`] subscription; a handle never
//! hears about its own writes. This is the only signal contexts have of
//! each other, and the lock and credential manager are built on it.

use tokio::sync::broadcast;

pub mod memory;

pub use memory::{ContextStorage, SharedStorage};

/// Identifies the execution context that performed a mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// A change made to the shared store by another context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    /// The key that changed
    ///
    /// `None` means any key may have changed and readers should reload
    /// whatever they are interested in.
    pub key: Option<String>,
    /// The key's new value, or `None` if it was removed
    pub new_value: Option<String>,
}

impl StorageEvent {
    /// Whether a reader interested in `key` should react to this event
    pub fn affects(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
    }

    /// Whether this event reports the removal of `key`
    ///
    /// Events with an unknown key count as possible removals.
    pub fn may_remove(&self, key: &str) -> bool {
        self.affects(key) && self.new_value.is_none()
    }

    fn resync() -> Self {
        Self {
            key: None,
            new_value: None,
        }
    }
}

/// A storage event tagged with the context that raised it
#[derive(Clone, Debug)]
pub struct StorageNotice {
    /// The context that performed the mutation
    pub origin: ContextId,
    /// The mutation itself
    pub event: StorageEvent,
}

/// A subscription to mutations made by other contexts
#[derive(Debug)]
pub struct StorageEvents {
    receiver: broadcast::Receiver<StorageNotice>,
    context: ContextId,
}

impl StorageEvents {
    /// Wraps a notice channel, filtering out mutations made by `context`
    pub fn new(receiver: broadcast::Receiver<StorageNotice>, context: ContextId) -> Self {
        Self { receiver, context }
    }

    /// Waits for the next mutation made by another context
    ///
    /// If this subscriber fell behind and notices were dropped, a resync
    /// event with no key is returned in their place. Returns `None` once
    /// the store is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) if notice.origin == self.context => continue,
                Ok(notice) => return Some(notice.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "storage subscriber lagged, requesting resync");
                    return Some(StorageEvent::resync());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// One context's handle onto a shared key/value store
pub trait Storage: Send + Sync {
    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`
    fn set(&self, key: &str, value: &str);

    /// Removes `key`; removing an absent key does nothing
    fn remove(&self, key: &str);

    /// Lists every key currently stored
    fn keys(&self) -> Vec<String>;

    /// Subscribes to mutations made by other contexts
    fn subscribe(&self) -> StorageEvents;

    /// Stores `value` under `key` only if the key currently holds
    /// `expected` (`None` meaning absent)
    ///
    /// Returns whether the value was stored. The default implementation is
    /// a plain read followed by a write; stores with a critical section
    /// should override it to make the comparison and the write atomic.
    fn replace_if(&self, key: &str, expected: Option<&str>, value: &str) -> bool {
        if self.get(key).as_deref() == expected {
            self.set(key, value);
            true
        } else {
            false
        }
    }

    /// Removes `key` only if it currently holds `expected`
    ///
    /// Returns whether the key was removed. The default implementation is
    /// a plain read followed by a removal.
    fn remove_if(&self, key: &str, expected: &str) -> bool {
        if self.get(key).as_deref() == Some(expected) {
            self.remove(key);
            true
        } else {
            false
        }
    }

    /// Stores `value` under `key` only if the key is absent
    ///
    /// Returns whether the value was stored.
    fn insert_if_absent(&self, key: &str, value: &str) -> bool {
        self.replace_if(key, None, value)
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }

    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }

    fn subscribe(&self) -> StorageEvents {
        (**self).subscribe()
    }

    fn replace_if(&self, key: &str, expected: Option<&str>, value: &str) -> bool {
        (**self).replace_if(key, expected, value)
    }

    fn remove_if(&self, key: &str, expected: &str) -> bool {
        (**self).remove_if(key, expected)
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> bool {
        (**self).insert_if_absent(key, value)
    }
}

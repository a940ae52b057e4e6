//! A cooperative mutex shared by execution contexts through storage
//!
//! Contexts share no memory, so the lock is nothing more than a record in
//! the shared store: present means held, absent means free. Acquisition is
//! a compare-and-swap against the record last read (absent, or stale);
//! waiting is driven by the store's change
//! notifications, with a timer as a fallback for notifications that never
//! arrive (for example, when the holder went away without releasing).
//!
//! Records carry their own lifetime. A record older than its timeout is
//! treated as absent by every acquirer, and [`sweep_stale_locks()`] clears
//! such records out of the store entirely.
//!
//! The lock does not verify ownership. Callers are trusted to pair
//! [`StorageLock::acquire_or_wait()`] with [`StorageLock::release()`].

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tabauth_clock::{Clock, UnixMillis};

use crate::{
    storage::{Storage, StorageEvents},
    LockName, LockNameRef,
};

/// The namespace under which lock records are stored
pub const LOCK_KEY_PREFIX: &str = "tabauth.lock.";

/// The persisted form of a held lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// How long the lock is valid, in milliseconds
    pub timeout: u64,
    /// When the lock was taken
    pub timestamp: UnixMillis,
}

impl LockRecord {
    /// Whether the record has outlived its timeout as of `now`
    pub fn is_expired_at(&self, now: UnixMillis) -> bool {
        now.0 > self.timestamp.0.saturating_add(self.timeout)
    }
}

/// The result of an attempt to take a lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and is now held
    Acquired,
    /// The lock was held elsewhere, was released, and is now held
    AcquiredAfterWait,
    /// The lock was not released in time; it is *not* held
    ///
    /// Callers may proceed, but without any serialization guarantee.
    TimedOut,
}

impl LockOutcome {
    /// Whether the caller now holds the lock
    pub fn is_held(self) -> bool {
        matches!(self, Self::Acquired | Self::AcquiredAfterWait)
    }
}

/// A named lock backed by a shared store
pub struct StorageLock {
    name: LockName,
    key: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for StorageLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StorageLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

impl StorageLock {
    /// Constructs a lock named `name` in the given store
    pub fn new(
        name: LockName,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let key = lock_key(&name);
        Self {
            name,
            key,
            storage,
            clock,
        }
    }

    /// The lock's name
    pub fn name(&self) -> &LockNameRef {
        &self.name
    }

    /// The storage key holding this lock's record
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Takes the lock, waiting up to `timeout` for another holder to release it
    ///
    /// A successful acquisition holds the lock for at most `timeout` before
    /// other contexts may treat it as abandoned.
    pub async fn acquire_or_wait(&self, timeout: Duration) -> LockOutcome {
        // Subscribe before looking, so a release between the look and the
        // wait is not missed.
        let mut events = self.storage.subscribe();

        if self.try_acquire(timeout) {
            tracing::debug!(lock = %self.name, "lock acquired");
            return LockOutcome::Acquired;
        }

        tracing::debug!(
            lock = %self.name,
            timeout_ms = timeout.as_millis() as u64,
            "lock held elsewhere, waiting for release"
        );

        match tokio::time::timeout(timeout, self.wait_for_release(&mut events, timeout)).await {
            Ok(()) => {
                tracing::debug!(lock = %self.name, "lock acquired after wait");
                LockOutcome::AcquiredAfterWait
            }
            Err(_) => {
                tracing::warn!(
                    lock = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for lock, proceeding without it"
                );
                LockOutcome::TimedOut
            }
        }
    }

    /// Releases the lock
    ///
    /// Releasing a lock that is not held is a no-op.
    pub fn release(&self) {
        self.storage.remove(&self.key);
        tracing::debug!(lock = %self.name, "lock released");
    }

    async fn wait_for_release(&self, events: &mut StorageEvents, timeout: Duration) {
        loop {
            match events.recv().await {
                Some(event) if event.may_remove(&self.key) => {
                    if self.try_acquire(timeout) {
                        return;
                    }
                    tracing::trace!(lock = %self.name, "lock taken by another waiter");
                }
                Some(_) => {}
                None => {
                    // The store is gone; only the timer can end the wait now.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn try_acquire(&self, timeout: Duration) -> bool {
        let now = self.clock.now_millis();
        let current = self.storage.get(&self.key);

        if let Some(raw) = &current {
            match serde_json::from_str::<LockRecord>(raw) {
                Ok(record) if !record.is_expired_at(now) => return false,
                Ok(record) => {
                    tracing::debug!(
                        lock = %self.name,
                        taken_at = record.timestamp.0,
                        timeout_ms = record.timeout,
                        "replacing stale lock record"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        lock = %self.name,
                        error = (&error as &dyn std::error::Error),
                        "replacing unreadable lock record"
                    );
                }
            }
        }

        let record = LockRecord {
            timeout: timeout.as_millis() as u64,
            timestamp: now,
        };

        match serde_json::to_string(&record) {
            // Only the record that was judged stale may be replaced; if another
            // context got there first, its record stands.
            Ok(raw) => self.storage.replace_if(&self.key, current.as_deref(), &raw),
            Err(error) => {
                tracing::warn!(
                    lock = %self.name,
                    error = (&error as &dyn std::error::Error),
                    "unable to encode lock record"
                );
                false
            }
        }
    }
}

fn lock_key(name: &LockNameRef) -> String {
    format!("{}{}", LOCK_KEY_PREFIX, name)
}

/// Removes every stale or unreadable lock record from the store
///
/// Returns the number of records removed. Meant to run once per context
/// before any lock is requested, so that locks abandoned by contexts that
/// went away cannot block the others.
pub fn sweep_stale_locks(storage: &dyn Storage, clock: &dyn Clock) -> usize {
    let now = clock.now_millis();
    let mut removed = 0;

    for key in storage.keys() {
        if !key.starts_with(LOCK_KEY_PREFIX) {
            continue;
        }

        let raw = match storage.get(&key) {
            Some(raw) => raw,
            None => continue,
        };

        let stale = serde_json::from_str::<LockRecord>(&raw)
            .map(|record| record.is_expired_at(now))
            .unwrap_or(true);

        if stale && storage.remove_if(&key, &raw) {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(removed, "swept stale lock records");
    }

    removed
}

#[cfg(test)]
mod tests {
    use tabauth_clock::{TestClock, UnixTime};
    use tracing_test::traced_test;

    use parking_lot::Mutex;

    use super::*;
    use crate::storage::{ContextStorage, SharedStorage};

    const WAIT: Duration = Duration::from_secs(10);

    fn lock_in(storage: &SharedStorage, clock: &TestClock) -> StorageLock {
        StorageLock::new(
            LockName::from_static("renewal"),
            Arc::new(storage.context()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn free_lock_is_acquired_immediately() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let lock = lock_in(&shared, &clock);

        assert_eq!(lock.acquire_or_wait(WAIT).await, LockOutcome::Acquired);

        let raw = shared.context().get("tabauth.lock.renewal").unwrap();
        let record: LockRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.timeout, 10_000);
        assert_eq!(record.timestamp, UnixMillis(1_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_is_announced_to_other_contexts() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let lock = lock_in(&shared, &clock);
        let mut events = shared.context().subscribe();

        lock.acquire_or_wait(WAIT).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.key.as_deref(), Some(lock.key()));
        assert!(event.new_value.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_holder_within_a_context() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let lock = lock_in(&shared, &clock);

        assert_eq!(lock.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
        assert_eq!(
            lock.acquire_or_wait(Duration::from_millis(100)).await,
            LockOutcome::TimedOut
        );

        lock.release();
        assert_eq!(lock.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_acquires_after_release() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let holder = lock_in(&shared, &clock);
        let waiter = lock_in(&shared, &clock);

        assert_eq!(holder.acquire_or_wait(WAIT).await, LockOutcome::Acquired);

        let waiting = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let outcome = waiter.acquire_or_wait(WAIT).await;
            (outcome, started.elapsed())
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        holder.release();

        let (outcome, waited) = waiting.await.unwrap();
        assert_eq!(outcome, LockOutcome::AcquiredAfterWait);
        assert!(waited < Duration::from_secs(3));
        assert!(shared.context().get("tabauth.lock.renewal").is_some());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn waiter_times_out_when_never_released() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let holder = lock_in(&shared, &clock);
        let waiter = lock_in(&shared, &clock);

        holder.acquire_or_wait(WAIT).await;

        let started = tokio::time::Instant::now();
        let outcome = waiter.acquire_or_wait(Duration::from_secs(3)).await;

        assert_eq!(outcome, LockOutcome::TimedOut);
        assert!(!outcome.is_held());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(logs_contain("timed out waiting for lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_of_several_waiters_wins_a_release() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let holder = lock_in(&shared, &clock);
        holder.acquire_or_wait(WAIT).await;

        let first = lock_in(&shared, &clock);
        let second = lock_in(&shared, &clock);
        let a = tokio::spawn(async move { first.acquire_or_wait(Duration::from_secs(1)).await });
        let b = tokio::spawn(async move { second.acquire_or_wait(Duration::from_secs(1)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        holder.release();

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_held()).count(), 1);
        assert!(outcomes.contains(&LockOutcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_record_is_treated_as_absent() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let abandoned = lock_in(&shared, &clock);
        abandoned.acquire_or_wait(WAIT).await;

        clock.advance(WAIT + Duration::from_millis(1));

        let lock = lock_in(&shared, &clock);
        assert_eq!(lock.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
    }

    /// A store handle that runs a callback right after the first read of
    /// `key`, letting a test interleave another context between the read
    /// and the write of an acquisition
    struct InterleavingStorage {
        inner: ContextStorage,
        key: &'static str,
        after_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl Storage for InterleavingStorage {
        fn get(&self, key: &str) -> Option<String> {
            let value = self.inner.get(key);
            if key == self.key {
                let callback = self.after_read.lock().take();
                if let Some(callback) = callback {
                    callback();
                }
            }
            value
        }

        fn set(&self, key: &str, value: &str) {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) {
            self.inner.remove(key)
        }

        fn keys(&self) -> Vec<String> {
            self.inner.keys()
        }

        fn subscribe(&self) -> StorageEvents {
            self.inner.subscribe()
        }

        fn replace_if(&self, key: &str, expected: Option<&str>, value: &str) -> bool {
            self.inner.replace_if(key, expected, value)
        }
    }

    #[test]
    fn stale_record_is_taken_over_by_only_one_context() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let stale = LockRecord {
            timeout: 10_000,
            timestamp: UnixMillis(clock.now_millis().0 - 20_000),
        };
        shared
            .context()
            .set("tabauth.lock.renewal", &serde_json::to_string(&stale).unwrap());

        let other = Arc::new(lock_in(&shared, &clock));
        let other_acquired = Arc::new(Mutex::new(None));
        let after_read: Box<dyn FnOnce() + Send> = {
            let other = Arc::clone(&other);
            let other_acquired = Arc::clone(&other_acquired);
            Box::new(move || *other_acquired.lock() = Some(other.try_acquire(WAIT)))
        };

        let lock = StorageLock::new(
            LockName::from_static("renewal"),
            Arc::new(InterleavingStorage {
                inner: shared.context(),
                key: "tabauth.lock.renewal",
                after_read: Mutex::new(Some(after_read)),
            }),
            Arc::new(clock.clone()),
        );

        assert!(!lock.try_acquire(WAIT));
        assert_eq!(*other_acquired.lock(), Some(true));

        let raw = shared.context().get("tabauth.lock.renewal").unwrap();
        let record: LockRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.timestamp, clock.now_millis());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_record_is_treated_as_absent() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        shared.context().set("tabauth.lock.renewal", "garbage");

        let lock = lock_in(&shared, &clock);
        assert_eq!(lock.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn locks_with_different_names_are_independent() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let renewal = lock_in(&shared, &clock);
        let other = StorageLock::new(
            LockName::from_static("other"),
            Arc::new(shared.context()),
            Arc::new(clock.clone()),
        );

        assert_eq!(renewal.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
        assert_eq!(other.acquire_or_wait(WAIT).await, LockOutcome::Acquired);
    }

    #[test]
    fn release_is_idempotent() {
        let shared = SharedStorage::new();
        let clock = TestClock::new(UnixTime(1_000));
        let lock = lock_in(&shared, &clock);

        lock.release();
        lock.release();
        assert!(shared.context().get(lock.key()).is_none());
    }

    #[test]
    fn sweep_removes_only_stale_lock_records() {
        let shared = SharedStorage::new();
        let storage = shared.context();
        let clock = TestClock::new(UnixTime(1_000));
        let now = clock.now_millis();

        let live = LockRecord {
            timeout: 10_000,
            timestamp: now,
        };
        let stale = LockRecord {
            timeout: 10_000,
            timestamp: UnixMillis(now.0 - 20_000),
        };

        storage.set("tabauth.lock.live", &serde_json::to_string(&live).unwrap());
        storage.set("tabauth.lock.stale", &serde_json::to_string(&stale).unwrap());
        storage.set("tabauth.lock.broken", "{");
        storage.set("unrelated", "{");

        assert_eq!(sweep_stale_locks(&storage, &clock), 2);

        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys, vec!["tabauth.lock.live", "unrelated"]);
    }
}

//! Per-key single-flight gate with waiter fan-out.
//!
//! A table row exists exactly while one caller (the owner) is computing a
//! value for that key. Late arrivals register a one-shot waiter and suspend;
//! the owner's release removes the row and publishes one result, success or
//! error, to every registered waiter.
//!
//! Correctness hinges on a single mutex guarding both row existence and the
//! waiter list: `wait` re-checks row existence under the same lock `release`
//! takes, so a waiter can never register against an already-released row and
//! block forever. Critical sections are lookup and list manipulation only;
//! no I/O and no `.await` happens while the table lock is held.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use strata_core::{CacheEntry, StrataError};

use crate::layer::CacheValue;

/// Result published to waiters on release.
pub type WaiterResult<T> = Result<CacheEntry<T>, StrataError>;

/// Outcome of [`KeyLockTable::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The caller now owns the key and must eventually release it.
    Acquired,
    /// Another caller owns the key; register a waiter or back off.
    AlreadyHeld,
}

struct KeyLockRow<T> {
    waiters: Vec<oneshot::Sender<WaiterResult<T>>>,
}

/// Table of in-flight refreshes, keyed by cache key.
pub struct KeyLockTable<T> {
    rows: Mutex<HashMap<String, KeyLockRow<T>>>,
}

impl<T: CacheValue> KeyLockTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to become the owner for `key`.
    ///
    /// Exactly one caller per key observes [`LockAttempt::Acquired`] until
    /// the owner releases.
    pub fn try_acquire(&self, key: &str) -> LockAttempt {
        let mut rows = self.rows.lock().unwrap();
        match rows.entry(key.to_string()) {
            Entry::Occupied(_) => LockAttempt::AlreadyHeld,
            Entry::Vacant(vacant) => {
                vacant.insert(KeyLockRow {
                    waiters: Vec::new(),
                });
                LockAttempt::Acquired
            }
        }
    }

    /// Register a waiter for the in-flight computation on `key`.
    ///
    /// Returns `None` when the owner already released: the row is gone and
    /// the caller should re-read through the normal path instead of
    /// suspending. The row check and waiter registration happen under one
    /// lock acquisition, so a returned receiver is guaranteed a delivery.
    pub fn wait(&self, key: &str) -> Option<oneshot::Receiver<WaiterResult<T>>> {
        let mut rows = self.rows.lock().unwrap();
        rows.get_mut(key).map(|row| {
            let (tx, rx) = oneshot::channel();
            row.waiters.push(tx);
            rx
        })
    }

    /// Release the key, publishing `result` to every registered waiter.
    ///
    /// Removes the row, so a waiter arriving afterwards goes back through
    /// the read path and sees whatever the owner wrote. An error released
    /// with no waiters registered is simply discarded. Waiters that gave up
    /// (dropped receivers) are skipped.
    pub fn release(&self, key: &str, result: WaiterResult<T>) {
        let row = self.rows.lock().unwrap().remove(key);
        // A release without a row is a double-release; harmless, but a bug
        // in the caller.
        debug_assert!(row.is_some(), "key lock released twice for {key}");
        if let Some(row) = row {
            for waiter in row.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// True while an owner is computing for `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.rows.lock().unwrap().contains_key(key)
    }

    /// Number of keys with an in-flight computation.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// True when no computation is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: CacheValue> Default for KeyLockTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use strata_core::RefreshError;

    fn entry(value: i32) -> CacheEntry<i32> {
        CacheEntry::with_ttl(value, Utc::now(), Duration::from_secs(60))
    }

    #[test]
    fn only_one_caller_acquires() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);
        assert_eq!(table.try_acquire("k"), LockAttempt::AlreadyHeld);
        assert_eq!(table.try_acquire("other"), LockAttempt::Acquired);
    }

    #[test]
    fn release_frees_the_key() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);
        table.release("k", Ok(entry(1)));
        assert!(!table.is_held("k"));
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);
    }

    #[test]
    fn wait_without_owner_returns_none() {
        let table = KeyLockTable::<i32>::new();
        assert!(table.wait("k").is_none());
    }

    #[tokio::test]
    async fn release_fans_out_to_all_waiters() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);

        let receivers: Vec<_> = (0..10).map(|_| table.wait("k").unwrap()).collect();
        table.release("k", Ok(entry(42)));

        for rx in receivers {
            let delivered = rx.await.unwrap().unwrap();
            assert_eq!(delivered.value, 42);
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn release_delivers_errors() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);
        let rx = table.wait("k").unwrap();

        let err: StrataError = RefreshError::FactoryFailed {
            key: "k".to_string(),
            reason: "boom".to_string(),
        }
        .into();
        table.release("k", Err(err.clone()));

        assert_eq!(rx.await.unwrap().unwrap_err(), err);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_block_release() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);

        let abandoned = table.wait("k").unwrap();
        let kept = table.wait("k").unwrap();
        drop(abandoned);

        table.release("k", Ok(entry(5)));
        assert_eq!(kept.await.unwrap().unwrap().value, 5);
    }

    #[test]
    fn error_release_with_no_waiters_is_discarded() {
        let table = KeyLockTable::<i32>::new();
        assert_eq!(table.try_acquire("k"), LockAttempt::Acquired);
        let err: StrataError = RefreshError::Cancelled {
            key: "k".to_string(),
        }
        .into();
        table.release("k", Err(err));
        assert!(table.is_empty());
    }
}

//! Per-account serialization.
//!
//! Events for one repository may be fanned out across many worker tasks;
//! this table re-serializes them. Entries are reference-counted and removed
//! when the last waiter releases, so the table stays empty at quiescence no
//! matter how many accounts have been seen.

use crate::foundation::Uid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    waiters: AtomicI32,
}

#[derive(Default)]
pub struct UserLocks {
    table: Mutex<HashMap<Uid, Arc<LockEntry>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the per-account lock, waiting behind earlier holders.
    ///
    /// The returned guard releases on drop, on every exit path: success,
    /// error, panic, or cancellation while still waiting (the waiter count
    /// is registered before the suspension point and unwound by drop).
    pub async fn lock(&self, uid: Uid) -> UserLockGuard<'_> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|err| err.into_inner());
            let entry = table
                .entry(uid)
                .or_insert_with(|| {
                    Arc::new(LockEntry { lock: Arc::new(tokio::sync::Mutex::new(())), waiters: AtomicI32::new(0) })
                })
                .clone();
            entry.waiters.fetch_add(1, Ordering::SeqCst);
            entry
        };
        let waiter = Waiter { locks: self, uid, entry: entry.clone() };
        let permit = entry.lock.clone().lock_owned().await;
        UserLockGuard { _permit: permit, _waiter: waiter }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|err| err.into_inner()).len()
    }
}

struct Waiter<'a> {
    locks: &'a UserLocks,
    uid: Uid,
    entry: Arc<LockEntry>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock().unwrap_or_else(|err| err.into_inner());
        if self.entry.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            table.remove(&self.uid);
        }
    }
}

/// Held for the duration of one validation. Field order matters: the mutex
/// permit releases before the waiter entry is unregistered.
pub struct UserLockGuard<'a> {
    _permit: OwnedMutexGuard<()>,
    _waiter: Waiter<'a>,
}

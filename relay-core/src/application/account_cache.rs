//! Bounded DID -> account cache.
//!
//! Non-authoritative: entries are refreshed only after the store accepts a
//! write, and invalidated on takedown or host reassignment.

use crate::domain::model::{Account, RepoState};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const DEFAULT_ACCOUNT_CACHE_CAPACITY: usize = 2_000_000;

#[derive(Clone, Debug)]
pub struct CachedAccount {
    pub account: Account,
    pub repo: Option<RepoState>,
}

pub struct AccountCache {
    inner: Mutex<LruCache<String, CachedAccount>>,
}

impl AccountCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn get(&self, did: &str) -> Option<CachedAccount> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner()).get(did).cloned()
    }

    /// Inserts or refreshes the account row, keeping any cached repo state.
    pub fn put_account(&self, account: Account) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let repo = inner.get(&account.did).and_then(|cached| cached.repo.clone());
        inner.put(account.did.clone(), CachedAccount { account, repo });
    }

    /// Records the latest accepted `(rev, data)` for a cached account.
    /// A miss (evicted entry) is fine; the store remains authoritative.
    pub fn update_repo_state(&self, did: &str, state: RepoState) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(cached) = inner.get_mut(did) {
            cached.repo = Some(state);
        }
    }

    pub fn invalidate(&self, did: &str) {
        self.inner.lock().unwrap_or_else(|err| err.into_inner()).pop(did);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|err| err.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

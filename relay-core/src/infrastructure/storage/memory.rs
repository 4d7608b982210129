use super::traits::{domain_matches, RelayStore};
use crate::domain::model::{Account, Host, HostStatus, RepoState};
use crate::foundation::{RelayError, Result, Tid, Uid};
use async_trait::async_trait;
use ipld_core::cid::Cid;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

struct MemoryInner {
    hosts: HashMap<u64, Host>,
    accounts: HashMap<String, Account>,
    repos: HashMap<Uid, RepoState>,
    bans: HashSet<String>,
    next_host_id: u64,
    next_uid: u64,
}

impl MemoryInner {
    fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            accounts: HashMap::new(),
            repos: HashMap::new(),
            bans: HashSet::new(),
            next_host_id: 1,
            next_uid: 1,
        }
    }
}

/// In-memory [`RelayStore`] for tests and ephemeral runs.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryInner::new()) }
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn upsert_host(&self, hostname: &str, ssl: bool, account_limit: i64) -> Result<Host> {
        let mut inner = self.lock_inner();
        if let Some(host) = inner.hosts.values().find(|h| h.hostname == hostname) {
            return Ok(host.clone());
        }
        let host = Host {
            id: inner.next_host_id,
            hostname: hostname.to_string(),
            ssl,
            concurrency: None,
            queue_depth: None,
            account_limit,
            status: HostStatus::Active,
            cursor: 0,
        };
        inner.next_host_id += 1;
        inner.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn host_by_name(&self, hostname: &str) -> Result<Option<Host>> {
        Ok(self.lock_inner().hosts.values().find(|h| h.hostname == hostname).cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let mut hosts: Vec<Host> = self.lock_inner().hosts.values().cloned().collect();
        hosts.sort_by_key(|h| h.id);
        Ok(hosts)
    }

    async fn update_host_status(&self, host_id: u64, status: HostStatus) -> Result<()> {
        let mut inner = self.lock_inner();
        let host = inner
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| RelayError::storage("memory", format!("unknown host {host_id}")))?;
        host.status = status;
        Ok(())
    }

    async fn update_host_cursor(&self, host_id: u64, cursor: i64) -> Result<()> {
        let mut inner = self.lock_inner();
        let host = inner
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| RelayError::storage("memory", format!("unknown host {host_id}")))?;
        host.cursor = cursor;
        Ok(())
    }

    async fn account_by_did(&self, did: &str) -> Result<Option<Account>> {
        Ok(self.lock_inner().accounts.get(did).cloned())
    }

    async fn create_account(&self, did: &str, host_id: u64) -> Result<Account> {
        let mut inner = self.lock_inner();
        if inner.accounts.contains_key(did) {
            return Err(RelayError::storage("memory", format!("account exists: {did}")));
        }
        let account = Account { uid: Uid(inner.next_uid), did: did.to_string(), host_id, taken_down: false };
        inner.next_uid += 1;
        inner.accounts.insert(did.to_string(), account.clone());
        Ok(account)
    }

    async fn account_count_for_host(&self, host_id: u64) -> Result<i64> {
        Ok(self.lock_inner().accounts.values().filter(|a| a.host_id == host_id).count() as i64)
    }

    async fn set_account_takedown(&self, uid: Uid, taken_down: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        for account in inner.accounts.values_mut() {
            if account.uid == uid {
                account.taken_down = taken_down;
                return Ok(());
            }
        }
        Err(RelayError::storage("memory", format!("unknown account {uid}")))
    }

    async fn repo_state(&self, uid: Uid) -> Result<Option<RepoState>> {
        Ok(self.lock_inner().repos.get(&uid).cloned())
    }

    async fn put_repo_state(&self, uid: Uid, rev: &Tid, data: &Cid) -> Result<()> {
        self.lock_inner().repos.insert(uid, RepoState { rev: rev.clone(), data: *data });
        Ok(())
    }

    async fn add_domain_ban(&self, domain: &str) -> Result<()> {
        self.lock_inner().bans.insert(domain.to_string());
        Ok(())
    }

    async fn is_domain_banned(&self, hostname: &str) -> Result<bool> {
        Ok(self.lock_inner().bans.iter().any(|banned| domain_matches(hostname, banned)))
    }
}

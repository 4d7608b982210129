use crate::domain::model::{Account, Host, HostStatus, RepoState};
use crate::foundation::{Result, Tid, Uid};
use async_trait::async_trait;
use ipld_core::cid::Cid;

/// Narrow repository interface over the relay's persistent state.
///
/// The store is authoritative; the account cache holds non-authoritative
/// copies that must be refreshed only after a successful write here.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Creates the host if it is unknown, returning the stored row either way.
    async fn upsert_host(&self, hostname: &str, ssl: bool, account_limit: i64) -> Result<Host>;
    async fn host_by_name(&self, hostname: &str) -> Result<Option<Host>>;
    async fn list_hosts(&self) -> Result<Vec<Host>>;
    async fn update_host_status(&self, host_id: u64, status: HostStatus) -> Result<()>;
    async fn update_host_cursor(&self, host_id: u64, cursor: i64) -> Result<()>;

    async fn account_by_did(&self, did: &str) -> Result<Option<Account>>;
    async fn create_account(&self, did: &str, host_id: u64) -> Result<Account>;
    async fn account_count_for_host(&self, host_id: u64) -> Result<i64>;
    async fn set_account_takedown(&self, uid: Uid, taken_down: bool) -> Result<()>;

    async fn repo_state(&self, uid: Uid) -> Result<Option<RepoState>>;
    /// Replaces the repo's `(rev, data)` in one atomic write.
    async fn put_repo_state(&self, uid: Uid, rev: &Tid, data: &Cid) -> Result<()>;

    async fn add_domain_ban(&self, domain: &str) -> Result<()>;
    /// True when `hostname` equals a banned domain or is a subdomain of one.
    async fn is_domain_banned(&self, hostname: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Suffix matching shared by store implementations.
pub(crate) fn domain_matches(hostname: &str, banned: &str) -> bool {
    hostname == banned || hostname.ends_with(&format!(".{banned}"))
}

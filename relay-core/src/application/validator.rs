//! Verification of `#commit` and `#sync` messages.
//!
//! The validator is stateless across calls except for the per-account lock
//! table and the account cache. One validation holds its account's lock from
//! entry to return; accepted `(rev, data)` state is persisted through the
//! store and only then reflected into the cache, both while the lock is
//! still held.

use crate::application::account_cache::AccountCache;
use crate::application::metrics::{EventKind, NoopMetrics, VerifyMetrics};
use crate::application::user_lock::UserLocks;
use crate::domain::commit::{load_commit_from_car, load_repo_from_car, Commit};
use crate::domain::event::{parse_commit_ops, CommitEvent, SyncEvent};
use crate::domain::model::{Account, Host, RepoState};
use crate::domain::mst::normalize_ops;
use crate::foundation::{Did, RecordPath, RelayError, Result, Tid, Uid};
use crate::infrastructure::identity::IdentityDirectory;
use crate::infrastructure::storage::RelayStore;
use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_REV_FUTURE: Duration = Duration::from_secs(3_600);

#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Clock-skew tolerance: how far in the future a commit rev may claim.
    pub max_rev_future: Duration,
    /// Treat identity-not-found as a warning instead of an error.
    pub allow_signature_not_found: bool,
    /// Reject delete/update ops without a `prev` instead of accepting them
    /// with a warning.
    pub refuse_legacy_ops: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { max_rev_future: DEFAULT_MAX_REV_FUTURE, allow_signature_not_found: false, refuse_legacy_ops: false }
    }
}

/// An accepted `#commit`, ready for downstream emission.
#[derive(Clone, Debug)]
pub struct ValidatedCommit {
    pub uid: Uid,
    pub did: Did,
    pub seq: i64,
    pub rev: Tid,
    pub new_root: Cid,
    pub warning: bool,
}

/// An accepted `#sync`.
#[derive(Clone, Debug)]
pub struct ValidatedSync {
    pub uid: Uid,
    pub did: Did,
    pub seq: i64,
    pub rev: Tid,
    pub new_root: Cid,
    pub warning: bool,
}

/// Result of [`Validator::verify_commit_message`]: what the message proved,
/// before any state is persisted.
#[derive(Clone, Debug)]
pub struct CommitVerification {
    pub did: Did,
    pub rev: Tid,
    pub new_root: Cid,
    pub warning: bool,
}

enum OutcomeBucket {
    Ok,
    Okish(&'static str),
}

pub struct Validator {
    locks: UserLocks,
    directory: Option<Arc<dyn IdentityDirectory>>,
    store: Arc<dyn RelayStore>,
    cache: Arc<AccountCache>,
    metrics: Arc<dyn VerifyMetrics>,
    max_rev_future: chrono::Duration,
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(
        directory: Option<Arc<dyn IdentityDirectory>>,
        store: Arc<dyn RelayStore>,
        cache: Arc<AccountCache>,
        config: ValidatorConfig,
    ) -> Self {
        let max_rev_future =
            chrono::Duration::from_std(config.max_rev_future).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            locks: UserLocks::new(),
            directory,
            store,
            cache,
            metrics: Arc::new(NoopMetrics),
            max_rev_future,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn VerifyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Number of live entries in the user-lock table. Zero at quiescence.
    pub fn lock_table_len(&self) -> usize {
        self.locks.len()
    }

    /// Validates one `#commit` for `account`, serialized against every other
    /// event for the same account. On success the accepted `(rev, data)` is
    /// persisted and cached before the lock is released.
    pub async fn handle_commit(
        &self,
        host: &Host,
        account: &Account,
        msg: &CommitEvent,
        cancel: &CancellationToken,
    ) -> Result<ValidatedCommit> {
        let _guard = self.locks.lock(account.uid).await;
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        let prev = self.previous_state(account).await?;
        let (prev_rev, prev_data) = match &prev {
            Some(state) => (Some(&state.rev), Some(&state.data)),
            None => (None, None),
        };
        let outcome = self.verify_commit_message(host, msg, prev_rev, prev_data).await?;
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        self.store.put_repo_state(account.uid, &outcome.rev, &outcome.new_root).await?;
        self.cache
            .update_repo_state(&account.did, RepoState { rev: outcome.rev.clone(), data: outcome.new_root });
        Ok(ValidatedCommit {
            uid: account.uid,
            did: outcome.did,
            seq: msg.seq,
            rev: outcome.rev,
            new_root: outcome.new_root,
            warning: outcome.warning,
        })
    }

    /// Validates one `#sync`. Carries only a commit block; no op checks.
    pub async fn handle_sync(
        &self,
        host: &Host,
        account: &Account,
        msg: &SyncEvent,
        cancel: &CancellationToken,
    ) -> Result<ValidatedSync> {
        let _guard = self.locks.lock(account.uid).await;
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        let hostname = host.hostname.as_str();
        let kind = EventKind::Sync;
        self.metrics.verify_start(kind);
        let mut warning = false;

        let fail = |err: RelayError| {
            self.metrics.verify_error(kind, hostname, err.reason());
            err
        };

        let did = Did::parse(&msg.did).map_err(&fail)?;
        let rev = Tid::parse(&msg.rev).map_err(&fail)?;
        self.check_rev_future(&rev).map_err(&fail)?;
        if DateTime::parse_from_rfc3339(&msg.time).is_err() {
            return Err(fail(RelayError::BadTime(msg.time.clone())));
        }

        let (commit, _blocks) = load_commit_from_car(&msg.blocks).map_err(&fail)?;
        self.cross_check(&commit, &did, &rev).map_err(&fail)?;
        self.verify_commit_signature(&commit, hostname, kind, &mut warning).await?;

        let new_root = commit.data;
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        self.store.put_repo_state(account.uid, &rev, &new_root).await?;
        self.cache.update_repo_state(&account.did, RepoState { rev: rev.clone(), data: new_root });
        self.metrics.verify_ok(kind, hostname);
        Ok(ValidatedSync { uid: account.uid, did, seq: msg.seq, rev, new_root, warning })
    }

    /// Verifies a commit message against structural, temporal, and
    /// cryptographic rules. `prev_rev`/`prev_data` come from accumulated
    /// per-repo state when known. Callers needing per-account serialization
    /// go through [`Validator::handle_commit`], which also persists the
    /// accepted state.
    pub async fn verify_commit_message(
        &self,
        host: &Host,
        msg: &CommitEvent,
        prev_rev: Option<&Tid>,
        prev_data: Option<&Cid>,
    ) -> Result<CommitVerification> {
        let hostname = host.hostname.as_str();
        let kind = EventKind::Commit;
        self.metrics.verify_start(kind);
        let mut warning = false;

        let fail = |err: RelayError| {
            self.metrics.verify_error(kind, hostname, err.reason());
            err
        };

        let did = Did::parse(&msg.repo).map_err(&fail)?;
        let rev = Tid::parse(&msg.rev).map_err(&fail)?;

        if let Some(prev_rev) = prev_rev {
            let cur_us = rev.timestamp_micros() as i64;
            let prev_us = prev_rev.timestamp_micros() as i64;
            if cur_us < prev_us {
                return Err(fail(RelayError::RevOutOfOrder { behind_us: prev_us - cur_us }));
            }
        }
        self.check_rev_future(&rev).map_err(&fail)?;
        if DateTime::parse_from_rfc3339(&msg.time).is_err() {
            return Err(fail(RelayError::BadTime(msg.time.clone())));
        }

        if msg.too_big {
            warn!("commit tooBig seq={} host={} repo={}", msg.seq, hostname, msg.repo);
            self.metrics.verify_warning(kind, hostname, "big");
            warning = true;
        }
        if msg.rebase {
            warn!("commit rebase seq={} host={} repo={}", msg.seq, hostname, msg.repo);
            self.metrics.verify_warning(kind, hostname, "reb");
            warning = true;
        }

        let (commit, tree) = load_repo_from_car(&msg.blocks).map_err(&fail)?;
        self.cross_check(&commit, &did, &rev).map_err(&fail)?;
        self.verify_commit_signature(&commit, hostname, kind, &mut warning).await?;

        // Each create/update must land in the MST and carry its record block.
        for op in &msg.ops {
            if op.action != "create" && op.action != "update" {
                continue;
            }
            let Some(op_cid) = op.cid else {
                continue;
            };
            let path = RecordPath::parse(&op.path).map_err(&fail)?;
            let found = tree.get(&path.to_string()).map_err(&fail)?;
            let Some(tree_cid) = found else {
                return Err(fail(RelayError::RecordNotFound(op.path.clone())));
            };
            if tree_cid != op_cid {
                return Err(fail(RelayError::OpCidMismatch { path: op.path.clone(), op: op_cid, tree: tree_cid }));
            }
            if !tree.blocks().contains(&op_cid) {
                return Err(fail(RelayError::MissingRecord(op_cid)));
            }
        }

        // Senders predating the prevData rollout omit prev on delete/update;
        // such commits cannot be inversion-checked and pass with a warning.
        for op in &msg.ops {
            if op.prev.is_some() || (op.action != "delete" && op.action != "update") {
                continue;
            }
            if self.config.refuse_legacy_ops {
                return Err(fail(RelayError::InconsistentOps(format!(
                    "{} op without prev at {}",
                    op.action, op.path
                ))));
            }
            warn!("commit {} op without prev seq={} host={} repo={}", op.action, msg.seq, hostname, msg.repo);
            let new_root = tree.root_cid().map_err(&fail)?;
            let status = if op.action == "delete" { "del" } else { "up" };
            self.metrics.verify_okish(kind, hostname, status);
            return Ok(CommitVerification { did, rev, new_root, warning });
        }

        let bucket;
        if let Some(claimed) = msg.prev_data {
            if let Some(prev_data) = prev_data {
                // Accumulated state disagreeing with the message is worth an
                // operator signal, but the inversion below decides validity.
                if *prev_data != claimed {
                    warn!("commit prevData mismatch seq={} host={} repo={}", msg.seq, hostname, msg.repo);
                    self.metrics.verify_warning(kind, hostname, "pr");
                    warning = true;
                }
            }

            let ops = parse_commit_ops(&msg.ops).map_err(&fail)?;
            let ops = normalize_ops(ops).map_err(&fail)?;
            let mut inverted = tree.snapshot();
            for op in ops.iter().rev() {
                inverted = inverted.invert_op(op).map_err(&fail)?;
            }
            let computed = inverted.root_cid().map_err(|err| fail(RelayError::InvertedRoot(err.to_string())))?;
            if computed != claimed {
                return Err(fail(RelayError::PrevDataMismatch { computed, claimed }));
            }

            bucket = if prev_data.is_none() {
                OutcomeBucket::Okish("new")
            } else if warning {
                OutcomeBucket::Okish("warn")
            } else {
                OutcomeBucket::Ok
            };
        } else {
            // sender still on the old protocol without prevData
            bucket = OutcomeBucket::Okish("old");
        }

        let new_root = tree.root_cid().map_err(&fail)?;
        match bucket {
            OutcomeBucket::Ok => self.metrics.verify_ok(kind, hostname),
            OutcomeBucket::Okish(status) => self.metrics.verify_okish(kind, hostname, status),
        }
        Ok(CommitVerification { did, rev, new_root, warning })
    }

    /// Looks up the repo owner's signing key and checks the commit signature.
    /// With no directory configured (test mode) this is a no-op.
    async fn verify_commit_signature(
        &self,
        commit: &Commit,
        hostname: &str,
        kind: EventKind,
        warning: &mut bool,
    ) -> Result<()> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let fail = |err: RelayError| {
            self.metrics.verify_error(kind, hostname, err.reason());
            err
        };
        let did = Did::parse(&commit.did).map_err(|_| fail(RelayError::BadCommitDid(commit.did.clone())))?;
        let identity = match directory.lookup_did(&did).await {
            Ok(identity) => identity,
            Err(RelayError::DidNotFound(_)) if self.config.allow_signature_not_found => {
                self.metrics.verify_warning(kind, hostname, "nok");
                *warning = true;
                return Ok(());
            }
            Err(err) => return Err(fail(RelayError::DidResolutionFailed(err.to_string()))),
        };
        let Some(key) = identity.signing_key else {
            return Err(fail(RelayError::NoSigningKey(did.to_string())));
        };
        if commit.verify_signature(&key).is_ok() {
            return Ok(());
        }
        // The cached identity document may be stale after a key rotation;
        // force one re-resolution before declaring the signature bad.
        if let Ok(fresh) = directory.refresh_did(&did).await {
            if let Some(fresh_key) = fresh.signing_key {
                if fresh_key != key && commit.verify_signature(&fresh_key).is_ok() {
                    return Ok(());
                }
            }
        }
        Err(fail(RelayError::BadSignature))
    }

    fn check_rev_future(&self, rev: &Tid) -> Result<()> {
        if rev.time() > Utc::now() + self.max_rev_future {
            return Err(RelayError::RevTooFarFuture { max_future_secs: self.max_rev_future.num_seconds() });
        }
        Ok(())
    }

    fn cross_check(&self, commit: &Commit, did: &Did, rev: &Tid) -> Result<()> {
        if commit.rev != rev.as_str() {
            return Err(RelayError::CommitRevMismatch { msg: rev.to_string(), car: commit.rev.clone() });
        }
        if commit.did != did.as_str() {
            return Err(RelayError::CommitDidMismatch { msg: did.to_string(), car: commit.did.clone() });
        }
        Ok(())
    }

    /// Accumulated `(rev, data)` for the account, cache-first with a store
    /// fallback. Runs under the account's lock.
    async fn previous_state(&self, account: &Account) -> Result<Option<RepoState>> {
        if let Some(cached) = self.cache.get(&account.did) {
            if cached.repo.is_some() {
                return Ok(cached.repo);
            }
        }
        let state = self.store.repo_state(account.uid).await?;
        if let Some(state) = &state {
            self.cache.put_account(account.clone());
            self.cache.update_repo_state(&account.did, state.clone());
        }
        Ok(state)
    }
}

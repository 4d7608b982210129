//! Per-host subscription lifecycle and bounded validation worker pools.
//!
//! Each active host gets one dispatcher task feeding a bounded queue and a
//! pool of workers draining it. Workers for the same host run in parallel;
//! the validator's per-account lock is the only per-repo serialization
//! point, so intra-host reordering across different repos is expected.

mod backoff;

pub use backoff::Backoff;

use crate::dispatcher::{EventDispatcher, RelayEvent};
use crate::firehose::FirehoseSource;
use crate::metrics::RelayMetrics;
use futures_util::StreamExt;
use log::{debug, info, warn};
use relay_core::application::{AccountCache, Validator};
use relay_core::domain::event::RepoMessage;
use relay_core::domain::model::{Account, Host, HostStatus};
use relay_core::foundation::{Did, RelayError, Result};
use relay_core::infrastructure::config::RelayConfig;
use relay_core::infrastructure::storage::RelayStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SUBSCRIBE_BACKOFF_BASE: Duration = Duration::from_millis(500);
const SUBSCRIBE_BACKOFF_CAP: Duration = Duration::from_secs(60);
const TRANSIENT_RETRIES: u32 = 2;

#[derive(Clone, Debug)]
pub struct SlurperConfig {
    pub ssl: bool,
    pub default_repo_limit: i64,
    pub concurrency_per_host: usize,
    pub max_queue_per_host: usize,
    pub skip_account_host_check: bool,
    pub shutdown_drain: Duration,
}

impl Default for SlurperConfig {
    fn default() -> Self {
        Self {
            ssl: true,
            default_repo_limit: 100,
            concurrency_per_host: 100,
            max_queue_per_host: 1_000,
            skip_account_host_check: false,
            shutdown_drain: Duration::from_secs(10),
        }
    }
}

impl SlurperConfig {
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            ssl: config.ssl,
            default_repo_limit: config.default_repo_limit,
            concurrency_per_host: config.concurrency_per_host,
            max_queue_per_host: config.max_queue_per_host,
            skip_account_host_check: config.skip_account_host_check,
            shutdown_drain: Duration::from_secs(config.shutdown_drain_secs),
        }
    }
}

struct HostHandle {
    /// Stops intake; workers drain what is already queued.
    stop: CancellationToken,
    /// Hard-cancels in-flight validations after the drain deadline.
    abort: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct SlurperState {
    store: Arc<dyn RelayStore>,
    validator: Arc<Validator>,
    cache: Arc<AccountCache>,
    source: Arc<dyn FirehoseSource>,
    dispatcher: Arc<dyn EventDispatcher>,
    metrics: Arc<RelayMetrics>,
    config: SlurperConfig,
    active: Mutex<HashMap<String, HostHandle>>,
    shutdown: CancellationToken,
}

pub struct Slurper {
    state: Arc<SlurperState>,
}

impl Slurper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RelayStore>,
        validator: Arc<Validator>,
        cache: Arc<AccountCache>,
        source: Arc<dyn FirehoseSource>,
        dispatcher: Arc<dyn EventDispatcher>,
        metrics: Arc<RelayMetrics>,
        config: SlurperConfig,
    ) -> Self {
        Self {
            state: Arc::new(SlurperState {
                store,
                validator,
                cache,
                source,
                dispatcher,
                metrics,
                config,
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn active_host_count(&self) -> usize {
        self.state.active.lock().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Starts dispatchers for every persisted non-banned host.
    pub async fn restart_all(&self) -> Result<usize> {
        let hosts = self.state.store.list_hosts().await?;
        let mut started = 0;
        for host in hosts {
            if host.status == HostStatus::Banned {
                debug!("skipping banned host={}", host.hostname);
                continue;
            }
            match self.subscribe_host(&host.hostname).await {
                Ok(()) => started += 1,
                Err(err) => warn!("restart failed host={} error={}", host.hostname, err),
            }
        }
        Ok(started)
    }

    /// Subscribes to one upstream host, creating it in the store on first
    /// sight. Queue and concurrency settings are read here; reconfiguration
    /// applies on the next subscribe cycle, never to a running pool.
    pub async fn subscribe_host(&self, hostname: &str) -> Result<()> {
        let state = &self.state;
        if state.store.is_domain_banned(hostname).await? {
            return Err(RelayError::DomainBanned(hostname.to_string()));
        }
        let host = state.store.upsert_host(hostname, state.config.ssl, state.config.default_repo_limit).await?;
        if host.status == HostStatus::Banned {
            return Err(RelayError::DomainBanned(hostname.to_string()));
        }
        {
            let mut active = state.active.lock().unwrap_or_else(|err| err.into_inner());
            if active.contains_key(hostname) {
                return Ok(());
            }

            let stop = state.shutdown.child_token();
            let abort = state.shutdown.child_token();
            let queue_depth =
                host.queue_depth.map(|d| d as usize).unwrap_or(state.config.max_queue_per_host).max(1);
            let concurrency =
                host.concurrency.map(|c| c as usize).unwrap_or(state.config.concurrency_per_host).max(1);
            let (tx, rx) = mpsc::channel::<RepoMessage>(queue_depth);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            let mut tasks = Vec::with_capacity(concurrency + 1);
            tasks.push(tokio::spawn(run_dispatcher(state.clone(), host.clone(), stop.clone(), tx)));
            for _ in 0..concurrency {
                tasks.push(tokio::spawn(run_worker(state.clone(), host.clone(), abort.clone(), rx.clone())));
            }
            active.insert(hostname.to_string(), HostHandle { stop, abort, tasks });
            state.metrics.set_active_hosts(active.len() as i64);
        }
        info!("subscribed host={}", hostname);
        Ok(())
    }

    /// Stops intake for `hostname`, lets queued events drain up to the
    /// configured deadline, then hard-cancels anything still running.
    pub async fn stop_host(&self, hostname: &str) {
        let handle = {
            let mut active = self.state.active.lock().unwrap_or_else(|err| err.into_inner());
            let handle = active.remove(hostname);
            self.state.metrics.set_active_hosts(active.len() as i64);
            handle
        };
        let Some(handle) = handle else {
            return;
        };
        handle.stop.cancel();
        let drained = tokio::time::timeout(
            self.state.config.shutdown_drain,
            futures_util::future::join_all(handle.tasks),
        )
        .await;
        if drained.is_err() {
            warn!("drain deadline exceeded, aborting workers host={}", hostname);
            handle.abort.cancel();
        }
        info!("stopped host={}", hostname);
    }

    /// Graceful shutdown of every active host.
    pub async fn shutdown(&self) {
        let hostnames: Vec<String> =
            self.state.active.lock().unwrap_or_else(|err| err.into_inner()).keys().cloned().collect();
        for hostname in hostnames {
            self.stop_host(&hostname).await;
        }
        self.state.shutdown.cancel();
    }
}

async fn run_dispatcher(
    state: Arc<SlurperState>,
    host: Host,
    stop: CancellationToken,
    tx: mpsc::Sender<RepoMessage>,
) {
    let mut backoff = Backoff::new(SUBSCRIBE_BACKOFF_BASE, SUBSCRIBE_BACKOFF_CAP);
    let mut cursor = (host.cursor > 0).then_some(host.cursor);
    let mut throttled = false;
    while !stop.is_cancelled() {
        let mut stream = match state.source.subscribe(&host, cursor).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("subscribe failed host={} error={}", host.hostname, err);
                state.metrics.inc_slurp_error(&host.hostname, "sub");
                if !throttled {
                    throttled = true;
                    let _ = state.store.update_host_status(host.id, HostStatus::Throttled).await;
                }
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        debug!("dispatcher consuming host={} cursor={:?}", host.hostname, cursor);
        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                None => break,
                Some(Err(err)) => {
                    warn!("stream error host={} error={}", host.hostname, err);
                    state.metrics.inc_slurp_error(&host.hostname, "stream");
                    break;
                }
                Some(Ok(msg)) => {
                    if throttled {
                        throttled = false;
                        backoff.reset();
                        let _ = state.store.update_host_status(host.id, HostStatus::Active).await;
                    }
                    if let Some(seq) = msg.seq() {
                        cursor = Some(seq);
                    }
                    state.metrics.inc_queued(&host.hostname);
                    // bounded queue: a full queue blocks the upstream read
                    let sent = tokio::select! {
                        _ = stop.cancelled() => return,
                        sent = tx.send(msg) => sent,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_worker(
    state: Arc<SlurperState>,
    host: Host,
    abort: CancellationToken,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RepoMessage>>>,
) {
    loop {
        let msg = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = abort.cancelled() => None,
                msg = rx.recv() => msg,
            }
        };
        let Some(msg) = msg else {
            return;
        };
        state.metrics.dec_queued(&host.hostname);
        let seq = msg.seq();
        if let Err(err) = process(&state, &host, msg, &abort).await {
            warn!("event dropped host={} seq={:?} reason={} error={}", host.hostname, seq, err.reason(), err);
            state.metrics.inc_slurp_error(&host.hostname, err.reason());
        }
    }
}

async fn process(state: &SlurperState, host: &Host, msg: RepoMessage, cancel: &CancellationToken) -> Result<()> {
    match msg {
        RepoMessage::Commit(commit) => {
            let account = resolve_account(state, host, &commit.repo).await?;
            if account.taken_down {
                debug!("dropping commit for taken-down account did={} seq={}", account.did, commit.seq);
                return Ok(());
            }
            let mut attempt = 0;
            let validated = loop {
                match state.validator.handle_commit(host, &account, &commit, cancel).await {
                    Ok(validated) => break validated,
                    Err(err) if err.is_transient() && attempt < TRANSIENT_RETRIES => {
                        attempt += 1;
                        warn!(
                            "transient failure, retrying host={} seq={} attempt={} error={}",
                            host.hostname, commit.seq, attempt, err
                        );
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                    Err(err) => return Err(err),
                }
            };
            let seq = commit.seq;
            state
                .dispatcher
                .emit(RelayEvent::Commit { hostname: host.hostname.clone(), commit: validated, msg: commit })
                .await?;
            if let Err(err) = state.store.update_host_cursor(host.id, seq).await {
                debug!("cursor update failed host={} error={}", host.hostname, err);
            }
            Ok(())
        }
        RepoMessage::Sync(sync) => {
            let account = resolve_account(state, host, &sync.did).await?;
            if account.taken_down {
                debug!("dropping sync for taken-down account did={} seq={}", account.did, sync.seq);
                return Ok(());
            }
            let validated = state.validator.handle_sync(host, &account, &sync, cancel).await?;
            let seq = sync.seq;
            state
                .dispatcher
                .emit(RelayEvent::Sync { hostname: host.hostname.clone(), sync: validated, msg: sync })
                .await?;
            if let Err(err) = state.store.update_host_cursor(host.id, seq).await {
                debug!("cursor update failed host={} error={}", host.hostname, err);
            }
            Ok(())
        }
        RepoMessage::Identity(msg) => {
            state.dispatcher.emit(RelayEvent::Identity { hostname: host.hostname.clone(), msg }).await
        }
        RepoMessage::Account(msg) => {
            state.dispatcher.emit(RelayEvent::Account { hostname: host.hostname.clone(), msg }).await
        }
        RepoMessage::Unrecognized { kind, seq } => {
            debug!("ignoring frame host={} kind={} seq={:?}", host.hostname, kind, seq);
            Ok(())
        }
    }
}

/// Cache-first account resolution, creating unknown accounts against the
/// sending host subject to its repo quota.
async fn resolve_account(state: &SlurperState, host: &Host, did: &str) -> Result<Account> {
    Did::parse(did)?;
    if let Some(cached) = state.cache.get(did) {
        return check_host_of_record(state, host, cached.account);
    }
    if let Some(account) = state.store.account_by_did(did).await? {
        state.cache.put_account(account.clone());
        return check_host_of_record(state, host, account);
    }
    let count = state.store.account_count_for_host(host.id).await?;
    if count >= host.account_limit {
        return Err(RelayError::RepoLimitExceeded { host: host.hostname.clone(), limit: host.account_limit });
    }
    let account = state.store.create_account(did, host.id).await?;
    debug!("created account did={} uid={} host={}", account.did, account.uid, host.hostname);
    state.cache.put_account(account.clone());
    Ok(account)
}

fn check_host_of_record(state: &SlurperState, host: &Host, account: Account) -> Result<Account> {
    if account.host_id != host.id && !state.config.skip_account_host_check {
        return Err(RelayError::WrongHost {
            did: account.did,
            expected: format!("host#{}", account.host_id),
            got: host.hostname.clone(),
        });
    }
    Ok(account)
}

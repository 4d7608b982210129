mod fixtures;

use fixtures::RepoFixture;
use relay_core::application::{AccountCache, EventKind, Validator, ValidatorConfig};
use relay_core::domain::event::{AccountEvent, IdentityEvent, RepoMessage};
use relay_core::domain::mst::Op;
use relay_core::infrastructure::identity::MemoryDirectory;
use relay_core::infrastructure::storage::{MemoryStore, RelayStore};
use relay_service::{ChannelDispatcher, MockFirehose, RelayEvent, RelayMetrics, Slurper, SlurperConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HOSTNAME: &str = "pds.example.com";
const DID_A: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";
const DID_B: &str = "did:plc:aaaaaaaaaaaaaaaaaaaaaaaa";

struct TestRig {
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    firehose: Arc<MockFirehose>,
    metrics: Arc<RelayMetrics>,
    slurper: Arc<Slurper>,
    events: mpsc::Receiver<RelayEvent>,
}

fn rig(config: SlurperConfig) -> TestRig {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    let cache = Arc::new(AccountCache::new(1024));
    let validator = Arc::new(Validator::new(
        Some(directory.clone()),
        store.clone(),
        cache.clone(),
        ValidatorConfig::default(),
    ));
    let firehose = Arc::new(MockFirehose::new());
    let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
    let (dispatcher, events) = ChannelDispatcher::channel(256);
    let slurper = Arc::new(Slurper::new(
        store.clone(),
        validator,
        cache,
        firehose.clone(),
        Arc::new(dispatcher),
        metrics.clone(),
        config,
    ));
    TestRig { store, directory, firehose, metrics, slurper, events }
}

fn test_config() -> SlurperConfig {
    SlurperConfig {
        concurrency_per_host: 1,
        max_queue_per_host: 16,
        shutdown_drain: Duration::from_secs(5),
        ..SlurperConfig::default()
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within deadline");
}

async fn subscribe_and_wait(rig: &TestRig) {
    rig.slurper.subscribe_host(HOSTNAME).await.expect("subscribe");
    let firehose = rig.firehose.clone();
    wait_until(|| {
        let firehose = firehose.clone();
        async move { firehose.subscriber_count(HOSTNAME) > 0 }
    })
    .await;
}

#[tokio::test]
async fn commits_flow_end_to_end_in_order() {
    let mut rig = rig(test_config());
    subscribe_and_wait(&rig).await;

    let mut repo = RepoFixture::with_did(DID_A, rig.directory.clone());
    let r1 = repo.record_cid("one");
    let r2 = repo.record_cid("two");
    for (seq, msg) in [
        (1, repo.commit_event(1, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", r1)])),
        (2, repo.commit_event(2, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2f", r2)])),
        (3, repo.commit_event(3, &[Op::update("app.bsky.feed.post/3k2aksuvwdl2e", r1, r2)])),
    ] {
        assert_eq!(rig.firehose.push(HOSTNAME, RepoMessage::Commit(msg)), 1, "seq {seq} delivered");
    }

    for expected_seq in 1..=3 {
        let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        match event {
            RelayEvent::Commit { hostname, commit, msg } => {
                assert_eq!(hostname, HOSTNAME);
                assert_eq!(msg.seq, expected_seq);
                assert_eq!(commit.seq, expected_seq);
                assert_eq!(commit.did.as_str(), DID_A);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // account was created on first sight and the cursor advanced
    let account = rig.store.account_by_did(DID_A).await.expect("query").expect("created");
    let state = rig.store.repo_state(account.uid).await.expect("query").expect("persisted");
    assert_eq!(state.data, repo.tree.root_cid().expect("root"));
    let host = rig.store.host_by_name(HOSTNAME).await.expect("query").expect("host");
    assert_eq!(host.cursor, 3);

    // first commit had no accumulated state, later ones verified fully
    assert_eq!(rig.metrics.okish_count(EventKind::Commit, HOSTNAME, "new"), 1);
    assert_eq!(rig.metrics.ok_count(EventKind::Commit, HOSTNAME), 2);

    rig.slurper.shutdown().await;
    assert_eq!(rig.slurper.active_host_count(), 0);
}

#[tokio::test]
async fn invalid_commit_is_dropped_and_counted() {
    let mut rig = rig(test_config());
    subscribe_and_wait(&rig).await;

    let mut repo = RepoFixture::with_did(DID_A, rig.directory.clone());
    let record = repo.record_cid("one");
    let mut bad = repo.commit_event(1, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", record)]);
    bad.time = "not a timestamp".to_string();
    rig.firehose.push(HOSTNAME, RepoMessage::Commit(bad));

    let metrics = rig.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.error_count(EventKind::Commit, HOSTNAME, "time") == 1 }
    })
    .await;

    // the pipeline keeps going: a valid retransmission passes
    let mut repo = RepoFixture::with_did(DID_A, rig.directory.clone());
    let record = repo.record_cid("one");
    let good = repo.commit_event(2, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", record)]);
    rig.firehose.push(HOSTNAME, RepoMessage::Commit(good));
    let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv()).await.expect("event").expect("open");
    assert!(matches!(event, RelayEvent::Commit { .. }));

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn host_account_quota_is_enforced() {
    let mut config = test_config();
    config.default_repo_limit = 1;
    let mut rig = rig(config);
    subscribe_and_wait(&rig).await;

    let mut repo_a = RepoFixture::with_did(DID_A, rig.directory.clone());
    let record = repo_a.record_cid("one");
    rig.firehose
        .push(HOSTNAME, RepoMessage::Commit(repo_a.commit_event(1, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", record)])));
    let event = tokio::time::timeout(Duration::from_secs(5), rig.events.recv()).await.expect("event").expect("open");
    assert!(matches!(event, RelayEvent::Commit { .. }));

    let mut repo_b = RepoFixture::with_did(DID_B, rig.directory.clone());
    let record = repo_b.record_cid("two");
    rig.firehose
        .push(HOSTNAME, RepoMessage::Commit(repo_b.commit_event(2, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", record)])));

    let metrics = rig.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.encode().expect("encode").contains("reason=\"quota\"") }
    })
    .await;
    assert!(rig.store.account_by_did(DID_B).await.expect("query").is_none());

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn events_for_foreign_accounts_are_dropped() {
    let mut rig = rig(test_config());
    // the account is owned by a different host than the one sending
    rig.store.create_account(DID_A, 99).await.expect("foreign account");
    subscribe_and_wait(&rig).await;

    let mut repo = RepoFixture::with_did(DID_A, rig.directory.clone());
    let record = repo.record_cid("one");
    rig.firehose
        .push(HOSTNAME, RepoMessage::Commit(repo.commit_event(1, &[Op::create("app.bsky.feed.post/3k2aksuvwdl2e", record)])));

    let metrics = rig.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.encode().expect("encode").contains("reason=\"host\"") }
    })
    .await;

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn identity_and_account_frames_pass_through() {
    let mut rig = rig(test_config());
    subscribe_and_wait(&rig).await;

    rig.firehose.push(
        HOSTNAME,
        RepoMessage::Identity(IdentityEvent {
            seq: 1,
            did: DID_A.to_string(),
            time: chrono::Utc::now().to_rfc3339(),
            handle: Some("alice.example.com".to_string()),
        }),
    );
    rig.firehose.push(
        HOSTNAME,
        RepoMessage::Account(AccountEvent {
            seq: 2,
            did: DID_A.to_string(),
            time: chrono::Utc::now().to_rfc3339(),
            active: false,
            status: Some("suspended".to_string()),
        }),
    );

    let first = tokio::time::timeout(Duration::from_secs(5), rig.events.recv()).await.expect("event").expect("open");
    assert!(matches!(first, RelayEvent::Identity { .. }));
    let second = tokio::time::timeout(Duration::from_secs(5), rig.events.recv()).await.expect("event").expect("open");
    assert!(matches!(second, RelayEvent::Account { .. }));

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn failed_subscriptions_throttle_then_recover() {
    let rig = rig(test_config());
    rig.firehose.fail_subscriptions(HOSTNAME, 2);
    rig.slurper.subscribe_host(HOSTNAME).await.expect("subscribe");

    let store = rig.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .host_by_name(HOSTNAME)
                .await
                .expect("query")
                .is_some_and(|h| h.status == relay_core::domain::model::HostStatus::Throttled)
        }
    })
    .await;

    // backoff retries land a working subscription
    let firehose = rig.firehose.clone();
    wait_until(|| {
        let firehose = firehose.clone();
        async move { firehose.subscriber_count(HOSTNAME) > 0 }
    })
    .await;

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn restart_all_skips_banned_hosts() {
    let rig = rig(test_config());
    let a = rig.store.upsert_host("alpha.example.com", true, 100).await.expect("host a");
    let b = rig.store.upsert_host("beta.example.com", true, 100).await.expect("host b");
    rig.store
        .update_host_status(b.id, relay_core::domain::model::HostStatus::Banned)
        .await
        .expect("ban b");

    let started = rig.slurper.restart_all().await.expect("restart");
    assert_eq!(started, 1);
    assert_eq!(rig.slurper.active_host_count(), 1);
    assert_eq!(a.status, relay_core::domain::model::HostStatus::Active);

    rig.slurper.shutdown().await;
}

#[tokio::test]
async fn banned_domains_are_refused() {
    let rig = rig(test_config());
    rig.store.add_domain_ban("example.com").await.expect("ban");
    let err = rig.slurper.subscribe_host(HOSTNAME).await.expect_err("banned");
    assert!(matches!(err, relay_core::foundation::RelayError::DomainBanned(_)));
    assert_eq!(rig.slurper.active_host_count(), 0);
}

#[tokio::test]
async fn stop_host_drains_queued_events() {
    let mut rig = rig(test_config());
    subscribe_and_wait(&rig).await;

    let mut repo = RepoFixture::with_did(DID_A, rig.directory.clone());
    let mut records = Vec::new();
    for i in 0..5 {
        records.push(repo.record_cid(&format!("record {i}")));
    }
    for (i, record) in records.iter().enumerate() {
        let path = format!("app.bsky.feed.post/3k2aksuvwdl2{}", (b'a' + i as u8) as char);
        rig.firehose
            .push(HOSTNAME, RepoMessage::Commit(repo.commit_event(i as i64 + 1, &[Op::create(path, *record)])));
    }

    // wait until the dispatcher has pulled everything off the wire, so the
    // stop below exercises queue drain rather than dropping unread frames
    let store = rig.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.host_by_name(HOSTNAME).await.expect("query").is_some_and(|h| h.cursor == 5) }
    })
    .await;

    rig.slurper.stop_host(HOSTNAME).await;
    assert_eq!(rig.slurper.active_host_count(), 0);

    let mut received = 0;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rig.events.recv()).await {
        if matches!(event, RelayEvent::Commit { .. }) {
            received += 1;
        }
    }
    assert_eq!(received, 5, "every accepted event reached the dispatcher");
}

//! Upstream subscription abstraction.
//!
//! The transport that actually speaks WebSocket + CBOR framing lives outside
//! this crate; the slurper only needs a stream of parsed messages per host.
//! [`MockFirehose`] is the in-process implementation used by tests and local
//! runs.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use relay_core::domain::event::RepoMessage;
use relay_core::domain::model::Host;
use relay_core::foundation::{RelayError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub type MessageStream = BoxStream<'static, Result<RepoMessage>>;

#[async_trait]
pub trait FirehoseSource: Send + Sync {
    /// Opens the repo event stream for `host`, resuming from `cursor` when
    /// the upstream supports it.
    async fn subscribe(&self, host: &Host, cursor: Option<i64>) -> Result<MessageStream>;
}

/// Broadcast-hub firehose: each hostname is a topic, `push` fans out to
/// every live subscription.
pub struct MockFirehose {
    topics: Mutex<HashMap<String, broadcast::Sender<RepoMessage>>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl MockFirehose {
    pub fn new() -> Self {
        Self { topics: Mutex::new(HashMap::new()), failures: Mutex::new(HashMap::new()) }
    }

    fn topic(&self, hostname: &str) -> broadcast::Sender<RepoMessage> {
        self.topics
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(hostname.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Delivers a message to every subscriber of `hostname`. Returns the
    /// number of live subscriptions reached.
    pub fn push(&self, hostname: &str, msg: RepoMessage) -> usize {
        self.topic(hostname).send(msg).unwrap_or(0)
    }

    pub fn subscriber_count(&self, hostname: &str) -> usize {
        self.topic(hostname).receiver_count()
    }

    /// Makes the next `count` subscription attempts for `hostname` fail,
    /// to exercise backoff and throttling.
    pub fn fail_subscriptions(&self, hostname: &str, count: u32) {
        self.failures.lock().unwrap_or_else(|err| err.into_inner()).insert(hostname.to_string(), count);
    }
}

impl Default for MockFirehose {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirehoseSource for MockFirehose {
    async fn subscribe(&self, host: &Host, _cursor: Option<i64>) -> Result<MessageStream> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|err| err.into_inner());
            if let Some(remaining) = failures.get_mut(&host.hostname) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RelayError::Transient(format!("mock subscribe failure for {}", host.hostname)));
                }
            }
        }
        let mut receiver = self.topic(&host.hostname).subscribe();
        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => yield Ok(msg),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Err(RelayError::Transient(format!("mock stream lagged by {skipped}")));
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use relay_core::domain::event::IdentityEvent;
    use relay_core::domain::model::HostStatus;

    fn host(name: &str) -> Host {
        Host {
            id: 1,
            hostname: name.to_string(),
            ssl: true,
            concurrency: None,
            queue_depth: None,
            account_limit: 100,
            status: HostStatus::Active,
            cursor: 0,
        }
    }

    fn identity(seq: i64) -> RepoMessage {
        RepoMessage::Identity(IdentityEvent {
            seq,
            did: "did:plc:aaa".to_string(),
            time: "2024-05-01T00:00:00Z".to_string(),
            handle: None,
        })
    }

    #[tokio::test]
    async fn push_reaches_subscribers() {
        let firehose = MockFirehose::new();
        let mut stream = firehose.subscribe(&host("pds.example.com"), None).await.expect("subscribe");
        assert_eq!(firehose.push("pds.example.com", identity(1)), 1);
        let msg = stream.next().await.expect("item").expect("ok");
        assert_eq!(msg.seq(), Some(1));
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let firehose = MockFirehose::new();
        firehose.fail_subscriptions("pds.example.com", 2);
        assert!(firehose.subscribe(&host("pds.example.com"), None).await.is_err());
        assert!(firehose.subscribe(&host("pds.example.com"), None).await.is_err());
        assert!(firehose.subscribe(&host("pds.example.com"), None).await.is_ok());
    }
}

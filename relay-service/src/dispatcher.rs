//! Downstream emission.
//!
//! The relay makes one [`EventDispatcher::emit`] call per accepted event;
//! fan-out buffering and per-subscriber backpressure belong to the
//! dispatcher implementation.

use async_trait::async_trait;
use relay_core::application::{ValidatedCommit, ValidatedSync};
use relay_core::domain::event::{AccountEvent, CommitEvent, IdentityEvent, SyncEvent};
use relay_core::foundation::{RelayError, Result};
use tokio::sync::mpsc;

/// A validated (or passthrough) event tagged with its upstream host.
#[derive(Clone, Debug)]
pub enum RelayEvent {
    Commit { hostname: String, commit: ValidatedCommit, msg: CommitEvent },
    Sync { hostname: String, sync: ValidatedSync, msg: SyncEvent },
    Identity { hostname: String, msg: IdentityEvent },
    Account { hostname: String, msg: AccountEvent },
}

impl RelayEvent {
    pub fn hostname(&self) -> &str {
        match self {
            RelayEvent::Commit { hostname, .. }
            | RelayEvent::Sync { hostname, .. }
            | RelayEvent::Identity { hostname, .. }
            | RelayEvent::Account { hostname, .. } => hostname,
        }
    }
}

#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn emit(&self, event: RelayEvent) -> Result<()>;
}

/// Dispatcher backed by a bounded channel; `emit` applies backpressure when
/// the consumer falls behind.
pub struct ChannelDispatcher {
    tx: mpsc::Sender<RelayEvent>,
}

impl ChannelDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventDispatcher for ChannelDispatcher {
    async fn emit(&self, event: RelayEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::Transient("event consumer dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::domain::event::IdentityEvent;

    fn identity_event(seq: i64) -> RelayEvent {
        RelayEvent::Identity {
            hostname: "pds.example.com".to_string(),
            msg: IdentityEvent {
                seq,
                did: "did:plc:aaa".to_string(),
                time: "2024-05-01T00:00:00Z".to_string(),
                handle: None,
            },
        }
    }

    #[tokio::test]
    async fn emits_in_order() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel(4);
        dispatcher.emit(identity_event(1)).await.expect("emit");
        dispatcher.emit(identity_event(2)).await.expect("emit");
        let first = rx.recv().await.expect("event");
        let second = rx.recv().await.expect("event");
        match (first, second) {
            (RelayEvent::Identity { msg: a, .. }, RelayEvent::Identity { msg: b, .. }) => {
                assert_eq!(a.seq, 1);
                assert_eq!(b.seq, 2);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_fails_when_consumer_gone() {
        let (dispatcher, rx) = ChannelDispatcher::channel(1);
        drop(rx);
        assert!(dispatcher.emit(identity_event(1)).await.is_err());
    }
}

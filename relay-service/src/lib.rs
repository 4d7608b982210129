//! Relay runtime: upstream host subscriptions, bounded validation worker
//! pools, and fan-in to a downstream dispatcher.
//!
//! The WebSocket transport and the downstream fan-out buffer are external
//! collaborators; this crate talks to them through [`FirehoseSource`] and
//! [`EventDispatcher`].

pub mod dispatcher;
pub mod firehose;
pub mod metrics;
pub mod slurper;

pub use dispatcher::{ChannelDispatcher, EventDispatcher, RelayEvent};
pub use firehose::{FirehoseSource, MessageStream, MockFirehose};
pub use metrics::RelayMetrics;
pub use slurper::{Slurper, SlurperConfig};

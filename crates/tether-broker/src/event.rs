//! Occurrences the broker publishes to application code.

use std::sync::Arc;

use tether_channel::ChannelError;
use tether_core::{AnswerBody, ChannelId, EventBody, RejectBody, ThreadUid};

/// Broker-level occurrence, fanned out over a `tokio::sync::broadcast`
/// stream.
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// A subscription finished its handshake.
    Connected {
        /// Thread.
        uid: ThreadUid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// A subscription ended.
    Disconnected {
        /// Thread.
        uid: ThreadUid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// A channel delivered an application event.
    Action {
        /// Origin channel.
        channel_id: ChannelId,
        /// Event.
        body: EventBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// A channel answered an earlier frame.
    Answer {
        /// Origin channel.
        channel_id: ChannelId,
        /// Answer.
        body: AnswerBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// A channel refused an earlier frame.
    Reject {
        /// Origin channel.
        channel_id: ChannelId,
        /// Reject.
        body: RejectBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// A channel failed, or a delivery to it did.
    Error {
        /// Affected channel.
        channel_id: ChannelId,
        /// What went wrong.
        error: Arc<ChannelError>,
    },
}

//! Broker error type.

use tether_channel::ChannelError;
use tether_core::{ChannelId, ThreadUid};
use thiserror::Error;

/// Broker operation failure.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The channel is not tracked by this broker.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// A connection record for the pair already exists.
    #[error("channel {channel_id} already has a connection to thread {uid}")]
    AlreadyConnected {
        /// Thread.
        uid: ThreadUid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// No connection record for the pair.
    #[error("channel {channel_id} has no connection to thread {uid}")]
    NotConnected {
        /// Thread.
        uid: ThreadUid,
        /// Channel.
        channel_id: ChannelId,
    },
    /// The channel refused the operation.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

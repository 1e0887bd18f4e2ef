//! Channel error type.

use tether_core::{ConnectionError, FrameError, TransportError};
use thiserror::Error;

/// Anything a channel operation or inbound frame can fail with.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The operation is invalid for the thread's handshake state.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The socket refused the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    /// An inbound frame could not be decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The channel has used up its sequence numbers.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,
}

impl ChannelError {
    /// The handshake-state error, if that is what this is.
    #[must_use]
    pub fn as_connection(&self) -> Option<&ConnectionError> {
        match self {
            Self::Connection(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ThreadUid;

    #[test]
    fn connection_errors_stay_transparent() {
        let err: ChannelError = ConnectionError::NoState(ThreadUid::from("t")).into();
        assert_eq!(err.to_string(), "no connection state for thread t");
        assert!(err.as_connection().is_some());
    }

    #[test]
    fn transport_error_is_not_a_connection_error() {
        let err: ChannelError = TransportError::Closed.into();
        assert!(err.as_connection().is_none());
    }

    #[test]
    fn exhausted_sequence_reads_plainly() {
        let err = ChannelError::SequenceExhausted;
        assert_eq!(err.to_string(), "sequence numbers exhausted");
        assert!(err.as_connection().is_none());
    }
}

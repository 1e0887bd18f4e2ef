//! Client errors.

use tether_channel::ChannelError;
use tokio_tungstenite::tungstenite;

/// Errors returned by [`Client`](crate::Client).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The `WebSocket` handshake failed.
    #[error("connect failed: {0}")]
    Connect(#[source] Box<tungstenite::Error>),

    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Connect(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ConnectionError, ThreadUid};

    #[test]
    fn channel_errors_pass_through() {
        let err = ClientError::from(ChannelError::from(ConnectionError::NotConnected(
            ThreadUid::from("t"),
        )));
        assert_eq!(err.to_string(), ConnectionError::NotConnected(ThreadUid::from("t")).to_string());
    }

    #[test]
    fn connect_error_is_prefixed() {
        let err = ClientError::from(tungstenite::Error::ConnectionClosed);
        assert!(err.to_string().starts_with("connect failed"));
    }
}

//! Error types shared by channels and their transports.
//!
//! - [`ConnectionError`]: an operation is invalid for the current handshake
//!   state of a thread. Raised synchronously and never retried; it signals an
//!   ordering bug in the caller.
//! - [`TransportError`]: the underlying socket refused or lost a send.

use thiserror::Error;

use crate::ids::ThreadUid;

/// Operation invalid for the current handshake state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// `connect` while the thread is already connected.
    #[error("already connected to thread {0}")]
    AlreadyConnected(ThreadUid),
    /// `connect` while a connect for the thread is still outstanding.
    #[error("already connecting to thread {0}")]
    AlreadyConnecting(ThreadUid),
    /// `connect` while the thread is being disconnected.
    #[error("thread {0} is disconnecting")]
    Disconnecting(ThreadUid),
    /// `event` on a thread that is not connected.
    #[error("not connected to thread {0}")]
    NotConnected(ThreadUid),
    /// `disconnect` on a thread with no handshake state.
    #[error("no connection state for thread {0}")]
    NoState(ThreadUid),
    /// `register` on a server-side channel.
    #[error("register is only allowed on client channels")]
    RegisterOnServer,
}

impl ConnectionError {
    /// Thread the error refers to, if any.
    #[must_use]
    pub fn uid(&self) -> Option<&ThreadUid> {
        match self {
            Self::AlreadyConnected(uid)
            | Self::AlreadyConnecting(uid)
            | Self::Disconnecting(uid)
            | Self::NotConnected(uid)
            | Self::NoState(uid) => Some(uid),
            Self::RegisterOnServer => None,
        }
    }
}

/// Socket-level send failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The socket is not open yet, or is closing.
    #[error("socket is not open")]
    NotOpen,
    /// The socket is gone.
    #[error("socket closed")]
    Closed,
    /// The write itself failed.
    #[error("send failed: {0}")]
    Send(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display_names_thread() {
        let err = ConnectionError::NotConnected(ThreadUid::from("room-1"));
        assert_eq!(err.to_string(), "not connected to thread room-1");
        assert_eq!(err.uid().map(ThreadUid::as_str), Some("room-1"));
    }

    #[test]
    fn register_error_has_no_thread() {
        assert!(ConnectionError::RegisterOnServer.uid().is_none());
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "socket closed");
        assert_eq!(
            TransportError::Send("broken pipe".into()).to_string(),
            "send failed: broken pipe"
        );
    }
}

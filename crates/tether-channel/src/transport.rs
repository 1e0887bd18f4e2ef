//! The socket abstraction a [`Channel`](crate::Channel) drives.
//!
//! Upgrade and framing mechanics live in the adapters (Axum on the server,
//! tungstenite on the client). The channel only needs to send text, ask for
//! the ready state, and close.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tether_core::TransportError;

/// Socket readiness, mirroring the WebSocket `readyState` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Handshake with the remote end still in progress.
    Connecting,
    /// Frames can be sent.
    Open,
    /// Close requested, not yet finished.
    Closing,
    /// Gone.
    Closed,
}

/// Duplex text socket.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one text frame. Resolves once the socket accepted the write.
    async fn send(&self, data: String) -> Result<(), TransportError>;

    /// Current readiness.
    fn ready_state(&self) -> ReadyState;

    /// Ask the socket to close. The resulting close is reported back as
    /// [`TransportEvent::Close`].
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Inbound socket occurrence, queued to the channel worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket finished opening.
    Open,
    /// A text frame arrived.
    Message(String),
    /// The socket closed.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket reported an error without closing.
    Error(TransportError),
}

/// HTTP request that opened a server-side socket, captured at accept time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    /// HTTP method of the upgrade request.
    pub method: String,
    /// Request URI.
    pub uri: String,
    /// Headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    /// `Origin` header, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl RequestInfo {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut info = RequestInfo::default();
        let _ = info
            .headers
            .insert("x-api-key".into(), "secret".into());
        assert_eq!(info.header("X-Api-Key"), Some("secret"));
        assert_eq!(info.header("missing"), None);
    }

    #[test]
    fn ready_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ReadyState::Closing).unwrap(),
            "\"closing\""
        );
    }
}

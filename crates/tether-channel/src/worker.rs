//! Inbound processing loop.
//!
//! One worker per channel drains the transport's inbound queue and feeds the
//! channel in arrival order. A frame is fully handled, including any echo it
//! triggers, before the next one is looked at.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::channel::Channel;
use crate::transport::TransportEvent;

/// Close code reported when the inbound queue ends without a close event.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Process transport events until the socket closes.
#[instrument(skip_all, fields(channel_id = %channel.id()))]
pub async fn run(channel: Arc<Channel>, mut inbound: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Open => debug!("transport open"),
            TransportEvent::Message(text) => channel.handle_message(&text).await,
            TransportEvent::Error(err) => channel.handle_transport_error(err),
            TransportEvent::Close { code, reason } => {
                channel.handle_close(code, &reason);
                return;
            }
        }
    }
    channel.handle_close(ABNORMAL_CLOSURE, "transport dropped");
}

/// Spawn [`run`] on the current runtime.
pub fn spawn(channel: Arc<Channel>, inbound: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(run(channel, inbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::event::ChannelEvent;
    use crate::memory::{MemoryTransport, link};
    use crate::transport::RequestInfo;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_core::{ChannelId, ConnectBody, DisconnectBody, EventBody, ThreadUid};

    struct Pair {
        server: Arc<Channel>,
        client: Arc<Channel>,
        server_tx: mpsc::Sender<TransportEvent>,
        client_tx: mpsc::Sender<TransportEvent>,
    }

    /// Two channels wired back to back, each with a running worker.
    fn pair() -> Pair {
        let (server_transport, server_wire) = MemoryTransport::new();
        let (client_transport, client_wire) = MemoryTransport::new();
        let server = Channel::server(
            ChannelId::new(),
            server_transport,
            RequestInfo::default(),
            ChannelConfig::default(),
        );
        let client = Channel::client(ChannelId::new(), client_transport, ChannelConfig::default());
        let (server_tx, server_rx) = mpsc::channel(16);
        let (client_tx, client_rx) = mpsc::channel(16);
        let _ = link(server_wire, client_tx.clone());
        let _ = link(client_wire, server_tx.clone());
        let _ = spawn(server.clone(), server_rx);
        let _ = spawn(client.clone(), client_rx);
        Pair {
            server,
            client,
            server_tx,
            client_tx,
        }
    }

    #[tokio::test]
    async fn server_initiated_subscription_round_trip() {
        let p = pair();
        let mut server_events = p.server.subscribe();
        let mut client_events = p.client.subscribe();

        let _ = p.server.connect(ConnectBody::new("room")).await.unwrap();
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Connect { .. }));
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Connect { .. }));

        let _ = p
            .server
            .event(EventBody::new("room", "chat", json!({"text": "hi"})))
            .await
            .unwrap();
        assert_matches!(
            client_events.recv().await,
            Some(ChannelEvent::Action { ref body, .. }) if body.payload["text"] == "hi"
        );

        let _ = p.client.disconnect(DisconnectBody::new("room")).await.unwrap();
        assert_matches!(server_events.recv().await, Some(ChannelEvent::Disconnect { .. }));
        assert_matches!(client_events.recv().await, Some(ChannelEvent::Disconnect { .. }));
        assert!(!p.server.is_connected_to(&ThreadUid::from("room")));
        assert!(!p.client.is_connected_to(&ThreadUid::from("room")));
    }

    #[tokio::test]
    async fn close_event_stops_the_worker() {
        let p = pair();
        let mut events = p.server.subscribe();
        p.server_tx
            .send(TransportEvent::Close {
                code: 1000,
                reason: "bye".into(),
            })
            .await
            .unwrap();
        assert_matches!(events.recv().await, Some(ChannelEvent::Close { code: 1000, .. }));
        drop(p.client_tx);
    }

    #[tokio::test]
    async fn dropped_queue_counts_as_abnormal_close() {
        let (transport, _wire) = MemoryTransport::new();
        let channel = Channel::client(ChannelId::new(), transport, ChannelConfig::default());
        let mut events = channel.subscribe();
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn(channel, rx);
        drop(tx);
        handle.await.unwrap();
        assert_matches!(
            events.recv().await,
            Some(ChannelEvent::Close { code: ABNORMAL_CLOSURE, .. })
        );
    }
}

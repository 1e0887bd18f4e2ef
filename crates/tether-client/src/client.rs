//! High-level client over one socket.

use std::sync::Arc;

use futures::StreamExt;
use tether_channel::{Channel, ChannelConfig, ChannelEvent, QueuedTransport, worker};
use tether_core::{
    AnswerBody, ChannelId, DisconnectBody, EventBody, RegisterBody, RejectBody, ThreadUid,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::ClientError;
use crate::transport::{run_reader, run_writer};

/// Client tuning.
#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// Protocol tuning for the client-side channel.
    pub channel: ChannelConfig,
    /// Capacity of the inbound queue feeding the channel worker.
    pub inbound_queue_size: usize,
    /// Capacity of the socket write queue.
    pub outbound_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            inbound_queue_size: 256,
            outbound_queue_size: 256,
        }
    }
}

/// A connected client-side channel.
///
/// Connects initiated by the server are confirmed automatically by the
/// channel. Everything the channel reports is available from
/// [`next_event`](Self::next_event).
pub struct Client {
    channel: Arc<Channel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    worker: JoinHandle<()>,
}

impl Client {
    /// Dial `url` with default tuning.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    /// Dial `url`.
    pub async fn connect_with(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let (ws, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(status = %response.status(), "websocket handshake complete");
        let (sink, stream) = ws.split();

        let (transport, outbound) = QueuedTransport::new(config.outbound_queue_size);
        let channel = Channel::client(ChannelId::new(), transport.clone(), config.channel);
        let events = channel.subscribe();

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size);
        drop(tokio::spawn(run_writer(sink, outbound)));
        drop(tokio::spawn(run_reader(stream, transport, inbound_tx)));
        let worker = worker::spawn(channel.clone(), inbound_rx);

        info!(channel_id = %channel.id(), %url, "client connected");
        Ok(Self {
            channel,
            events,
            worker,
        })
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Local id of the channel.
    pub fn id(&self) -> &ChannelId {
        self.channel.id()
    }

    /// Ask the server for a subscription.
    pub async fn register(&self, body: RegisterBody) -> Result<u64, ClientError> {
        Ok(self.channel.register(body).await?)
    }

    /// Send an event on a connected thread.
    pub async fn event(&self, body: EventBody) -> Result<u64, ClientError> {
        Ok(self.channel.event(body).await?)
    }

    /// Answer an inbound event.
    pub async fn answer(&self, body: AnswerBody) -> Result<u64, ClientError> {
        Ok(self.channel.answer(body).await?)
    }

    /// Reject an inbound frame.
    pub async fn reject(&self, body: RejectBody) -> Result<u64, ClientError> {
        Ok(self.channel.reject(body).await?)
    }

    /// Leave a thread.
    pub async fn disconnect(&self, uid: ThreadUid) -> Result<Option<u64>, ClientError> {
        Ok(self.channel.disconnect(DisconnectBody::new(uid)).await?)
    }

    /// Close the socket.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        Ok(self.channel.close(code, reason).await?)
    }

    /// Next channel occurrence, or `None` once the socket is gone and every
    /// occurrence was consumed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Whether the thread is connected.
    pub fn is_connected_to(&self, uid: &ThreadUid) -> bool {
        self.channel.is_connected_to(uid)
    }

    /// Whether a connect for the thread is outstanding.
    pub fn is_connecting_to(&self, uid: &ThreadUid) -> bool {
        self.channel.is_connecting_to(uid)
    }

    /// Whether a disconnect for the thread is outstanding.
    pub fn is_disconnecting_to(&self, uid: &ThreadUid) -> bool {
        self.channel.is_disconnecting_to(uid)
    }

    /// Wait until the socket closed and the channel processed it.
    pub async fn closed(self) {
        if let Err(e) = self.worker.await {
            debug!(error = %e, "client worker failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::SinkExt;
    use serde_json::json;
    use tether_core::{Frame, FrameBody, FrameKind};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Accept one socket and hand its stream to `script`.
    async fn serve_once<F, Fut>(script: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        }));
        format!("ws://{addr}")
    }

    async fn next_frame(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Frame {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => return Frame::decode(t.as_str()).unwrap(),
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn confirms_server_connect_and_receives_events() {
        let url = serve_once(|mut ws| async move {
            let register = next_frame(&mut ws).await;
            assert_eq!(register.kind(), FrameKind::Register);

            let connect = Frame::new(
                1,
                FrameBody::Connect(tether_core::ConnectBody::new(ThreadUid::from("room"))),
            );
            ws.send(Message::Text(connect.encode().unwrap().into()))
                .await
                .unwrap();
            let echo = next_frame(&mut ws).await;
            assert_matches!(echo.body, FrameBody::Connect(ref b) if b.req == Some(1));

            let event = Frame::new(
                2,
                FrameBody::Event(EventBody::new(
                    ThreadUid::from("room"),
                    "chat",
                    json!({"text": "hi"}),
                )),
            );
            ws.send(Message::Text(event.encode().unwrap().into()))
                .await
                .unwrap();
            // hold the socket until the client leaves
            while ws.next().await.is_some() {}
        })
        .await;

        let mut client = Client::connect(&url).await.unwrap();
        let _ = client.register(RegisterBody::new("default")).await.unwrap();

        let room = ThreadUid::from("room");
        assert_matches!(client.next_event().await, Some(ChannelEvent::Connect { ref uid, .. }) if *uid == room);
        assert!(client.is_connected_to(&room));
        assert_matches!(
            client.next_event().await,
            Some(ChannelEvent::Action { ref body, seq: 2 }) if body.kind == "chat"
        );

        client.close(1000, "done").await.unwrap();
        assert_matches!(
            client.next_event().await,
            Some(ChannelEvent::Disconnect { ref uid, seq: None }) if *uid == room
        );
        assert_matches!(client.next_event().await, Some(ChannelEvent::Close { .. }));
        assert!(!client.is_connected_to(&room));
        client.closed().await;
    }

    #[tokio::test]
    async fn event_on_unknown_thread_is_refused_locally() {
        let url = serve_once(|mut ws| async move { while ws.next().await.is_some() {} }).await;
        let client = Client::connect(&url).await.unwrap();
        let err = client
            .event(EventBody::new(ThreadUid::from("nope"), "x", json!(null)))
            .await
            .unwrap_err();
        assert_matches!(err, ClientError::Channel(_));
    }

    #[tokio::test]
    async fn refused_dial_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = Client::connect(&format!("ws://{addr}")).await.err().unwrap();
        assert_matches!(err, ClientError::Connect(_));
    }
}

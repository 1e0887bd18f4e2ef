//! tungstenite socket adapter.
//!
//! The socket is split into a writer task draining the channel's
//! [`Outbound`] queue and a reader task turning socket messages into
//! [`TransportEvent`]s for the channel worker.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tether_channel::{Outbound, QueuedTransport, ReadyState, TransportEvent};
use tether_core::TransportError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// Close code reported when the socket vanished without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported for a close frame without a status.
const NO_STATUS: u16 = 1005;

/// Drain `outbound` into `sink`, acknowledging each text write.
pub async fn run_writer<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(cmd) = outbound.recv().await {
        match cmd {
            Outbound::Text { text, ack } => {
                let result = sink
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|e| TransportError::Send(e.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not sent");
                }
                break;
            }
        }
    }
}

/// Feed socket messages into `inbound` until the socket closes.
///
/// Always finishes with a [`TransportEvent::Close`] and marks `transport`
/// closed before doing so.
pub async fn run_reader<S>(
    mut stream: S,
    transport: Arc<QueuedTransport>,
    inbound: mpsc::Sender<TransportEvent>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let (code, reason) = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or((NO_STATUS, String::new()), |f| {
                    (u16::from(f.code), f.reason.to_string())
                });
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "socket read failed");
                let _ = inbound
                    .send(TransportEvent::Error(TransportError::Send(e.to_string())))
                    .await;
                break (ABNORMAL_CLOSURE, e.to_string());
            }
            None => break (ABNORMAL_CLOSURE, "connection dropped".to_owned()),
        };
        if inbound.send(TransportEvent::Message(text)).await.is_err() {
            return;
        }
    };

    transport.set_ready_state(ReadyState::Closed);
    let _ = inbound.send(TransportEvent::Close { code, reason }).await;
}

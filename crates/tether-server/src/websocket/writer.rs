//! Outbound half of a server socket.
//!
//! Drains the channel's [`Outbound`] queue into the socket, acknowledging
//! each write, and interleaves heartbeat pings. Returns why it stopped.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use metrics::counter;
use parking_lot::Mutex;
use tether_channel::Outbound;
use tether_core::TransportError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::WS_HEARTBEAT_TIMEOUTS_TOTAL;

/// Close code sent when the peer stops answering pings or the server stops.
pub const GOING_AWAY: u16 = 1001;

/// Why the writer stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriterExit {
    /// The channel asked for a close, which was sent.
    Closed {
        /// Close code sent.
        code: u16,
        /// Close reason sent.
        reason: String,
    },
    /// No pong within the heartbeat timeout.
    HeartbeatTimeout,
    /// Server shutdown.
    Shutdown,
    /// The socket refused a write.
    SocketError(String),
    /// The outbound queue closed.
    QueueClosed,
}

impl WriterExit {
    /// Close code and reason reported to the channel.
    pub fn close_status(&self) -> (u16, String) {
        match self {
            Self::Closed { code, reason } => (*code, reason.clone()),
            Self::HeartbeatTimeout => (GOING_AWAY, "heartbeat timeout".into()),
            Self::Shutdown => (GOING_AWAY, "server shutting down".into()),
            Self::SocketError(err) => (1006, err.clone()),
            Self::QueueClosed => (1006, "outbound queue closed".into()),
        }
    }
}

/// Heartbeat timing.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// Interval between pings.
    pub interval: Duration,
    /// Give up after this long without a pong.
    pub timeout: Duration,
}

/// Drive the outbound half of `sink` until it stops.
///
/// `last_pong` is refreshed by the reader whenever a ping or pong arrives.
pub async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    last_pong: Arc<Mutex<Instant>>,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval(heartbeat.interval);
    // skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Text { text, ack }) => {
                    let result = sink
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()));
                    let failed = result.as_ref().err().map(ToString::to_string);
                    let _ = ack.send(result);
                    if let Some(err) = failed {
                        return WriterExit::SocketError(err);
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    send_close(&mut sink, code, &reason).await;
                    return WriterExit::Closed { code, reason };
                }
                None => return WriterExit::QueueClosed,
            },
            _ = ping.tick() => {
                let silent_for = last_pong.lock().elapsed();
                if silent_for > heartbeat.timeout {
                    warn!(?silent_for, "peer unresponsive, closing");
                    counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    send_close(&mut sink, GOING_AWAY, "heartbeat timeout").await;
                    return WriterExit::HeartbeatTimeout;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return WriterExit::SocketError(e.to_string());
                }
            }
            () = cancel.cancelled() => {
                send_close(&mut sink, GOING_AWAY, "server shutting down").await;
                return WriterExit::Shutdown;
            }
        }
    }
}

async fn send_close<S>(sink: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_owned().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }

    #[tokio::test]
    async fn writes_are_acknowledged() {
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(
            sink,
            rx,
            Arc::new(Mutex::new(Instant::now())),
            heartbeat(),
            CancellationToken::new(),
        ));

        let (ack, done) = tokio::sync::oneshot::channel();
        tx.send(Outbound::Text {
            text: "hello".into(),
            ack,
        })
        .await
        .unwrap();
        assert_eq!(done.await.unwrap(), Ok(()));
        assert_matches!(socket.next().await, Some(Message::Text(t)) if t.as_str() == "hello");

        tx.send(Outbound::Close {
            code: 1000,
            reason: "done".into(),
        })
        .await
        .unwrap();
        assert_matches!(socket.next().await, Some(Message::Close(Some(f))) if f.code == 1000);
        assert_eq!(
            writer.await.unwrap(),
            WriterExit::Closed {
                code: 1000,
                reason: "done".into()
            }
        );
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let (sink, mut socket) = fmpsc::unbounded::<Message>();
        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            sink,
            rx,
            Arc::new(Mutex::new(Instant::now())),
            heartbeat(),
            cancel.clone(),
        ));
        cancel.cancel();
        assert_eq!(writer.await.unwrap(), WriterExit::Shutdown);
        assert_matches!(socket.next().await, Some(Message::Close(Some(f))) if f.code == GOING_AWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (sink, socket) = fmpsc::unbounded::<Message>();
        let (_tx, rx) = mpsc::channel(4);
        let exit = run_writer(
            sink,
            rx,
            Arc::new(Mutex::new(Instant::now())),
            Heartbeat {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(3),
            },
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, WriterExit::HeartbeatTimeout);

        let mut pings = 0;
        for msg in socket.collect::<Vec<_>>().await {
            match msg {
                Message::Ping(_) => pings += 1,
                Message::Close(Some(f)) => assert_eq!(f.code, GOING_AWAY),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(pings >= 2);
    }

    #[test]
    fn exit_maps_to_close_status() {
        assert_eq!(WriterExit::HeartbeatTimeout.close_status().0, GOING_AWAY);
        assert_eq!(WriterExit::QueueClosed.close_status().0, 1006);
    }
}

//! Queue-backed transport shared by the socket adapters.
//!
//! The channel side pushes [`Outbound`] commands into a bounded queue. A
//! writer task owned by the adapter drains it into the real socket and
//! acknowledges each text frame once the write resolved, so
//! [`Transport::send`] only returns after the socket accepted the data.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::TransportError;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{ReadyState, Transport};

/// Command for the writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Write a text frame, then report the outcome on `ack`.
    Text {
        /// Frame text.
        text: String,
        /// Write outcome.
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    /// Send a close frame and stop writing.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Transport whose writes go through a queue to a writer task.
#[derive(Debug)]
pub struct QueuedTransport {
    tx: mpsc::Sender<Outbound>,
    state: Mutex<ReadyState>,
}

impl QueuedTransport {
    /// New open transport and the queue its writer task drains.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Arc::new(Self {
            tx,
            state: Mutex::new(ReadyState::Open),
        });
        (transport, rx)
    }

    /// Record a readiness change observed by the adapter.
    pub fn set_ready_state(&self, state: ReadyState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl Transport for QueuedTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if *self.state.lock() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outbound::Text { text, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return Ok(());
            }
            *state = ReadyState::Closing;
        }
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn send_waits_for_the_writer_ack() {
        let (transport, mut rx) = QueuedTransport::new(4);
        let writer = tokio::spawn(async move {
            let Some(Outbound::Text { text, ack }) = rx.recv().await else {
                panic!("expected text");
            };
            let _ = ack.send(Ok(()));
            text
        });
        transport.send("frame".into()).await.unwrap();
        assert_eq!(writer.await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn failed_write_is_reported() {
        let (transport, mut rx) = QueuedTransport::new(4);
        let _writer = tokio::spawn(async move {
            if let Some(Outbound::Text { ack, .. }) = rx.recv().await {
                let _ = ack.send(Err(TransportError::Send("reset".into())));
            }
        });
        assert_eq!(
            transport.send("frame".into()).await,
            Err(TransportError::Send("reset".into()))
        );
    }

    #[tokio::test]
    async fn dropped_writer_means_closed() {
        let (transport, rx) = QueuedTransport::new(4);
        drop(rx);
        assert_eq!(transport.send("x".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_queued_once() {
        let (transport, mut rx) = QueuedTransport::new(4);
        transport.close(1000, "bye").await.unwrap();
        transport.close(1000, "again").await.unwrap();
        assert_eq!(transport.ready_state(), ReadyState::Closing);
        assert_matches!(rx.recv().await, Some(Outbound::Close { code: 1000, .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.send("late".into()).await, Err(TransportError::NotOpen));
    }
}

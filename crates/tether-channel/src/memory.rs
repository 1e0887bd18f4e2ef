//! In-process transport.
//!
//! [`MemoryTransport`] hands every sent frame to an unbounded queue instead
//! of a socket. Tests read the queue to see what went on the wire, and
//! [`link`] forwards it into another channel's inbound queue to wire two
//! channels back to back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::TransportError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{ReadyState, Transport, TransportEvent};

/// Transport backed by a queue.
#[derive(Debug)]
pub struct MemoryTransport {
    wire: mpsc::UnboundedSender<String>,
    state: Mutex<ReadyState>,
    failing: AtomicBool,
}

impl MemoryTransport {
    /// New open transport and the receiving end of its wire.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (wire, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            wire,
            state: Mutex::new(ReadyState::Open),
            failing: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Make every following send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Override the reported ready state.
    pub fn set_ready_state(&self, state: ReadyState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: String) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Send("injected failure".into()));
        }
        if *self.state.lock() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.wire.send(data).map_err(|_| TransportError::Closed)
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    async fn close(&self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        *self.state.lock() = ReadyState::Closed;
        Ok(())
    }
}

/// Forward everything sent on `wire` into `inbound` as messages.
pub fn link(
    mut wire: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = wire.recv().await {
            if inbound.send(TransportEvent::Message(text)).await.is_err() {
                break;
            }
        }
    })
}

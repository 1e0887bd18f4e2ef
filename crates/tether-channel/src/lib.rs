//! # tether-channel
//!
//! The protocol engine for one physical duplex connection.
//!
//! A [`Channel`] owns a [`Transport`], runs the two-way confirmed
//! connect/disconnect handshake per thread, gates outbound events on the
//! handshake state and reports protocol occurrences as [`ChannelEvent`]s to
//! every subscriber.
//!
//! Inbound transport traffic is fed through [`worker::run`], which processes
//! one channel's frames strictly in arrival order.

#![deny(unsafe_code)]

pub mod channel;
pub mod errors;
pub mod event;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod queued;
pub mod state;
pub mod transport;
pub mod worker;

pub use channel::{Channel, ChannelConfig};
pub use errors::ChannelError;
pub use event::ChannelEvent;
pub use queued::{Outbound, QueuedTransport};
pub use state::{HandshakeState, Origin, Phase, Terminal};
pub use transport::{ReadyState, RequestInfo, Transport, TransportEvent};

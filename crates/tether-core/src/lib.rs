//! # tether-core
//!
//! Shared vocabulary for the tether pub/sub transport.
//!
//! - **Branded IDs**: [`ChannelId`] for physical connections, [`ThreadUid`] for topics
//! - **Frames**: [`Frame`] and its bodies, plus the JSON wire codec
//! - **Errors**: [`ConnectionError`] for invalid handshake states, [`TransportError`] for sockets
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;

pub use errors::{ConnectionError, TransportError};
pub use frame::{
    AnswerBody, ConnectBody, DisconnectBody, EventBody, Frame, FrameBody, FrameError, FrameKind,
    RegisterBody, RejectBody, reject_code,
};
pub use ids::{ChannelId, ThreadUid};

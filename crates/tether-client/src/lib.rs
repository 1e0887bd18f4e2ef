//! # tether-client
//!
//! Client side of the tether transport over `tokio-tungstenite`.
//!
//! [`Client::connect`] dials a server, wraps the socket in a client-side
//! [`Channel`](tether_channel::Channel) and exposes its operations plus the
//! stream of [`ChannelEvent`](tether_channel::ChannelEvent)s.

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use errors::ClientError;

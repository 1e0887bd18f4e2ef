//! # tether-broker
//!
//! Multiplexes threads over many channels.
//!
//! The [`Broker`] tracks every server-side channel, keeps one connection
//! record per `(thread, channel)` subscription, admits client registrations
//! through a pluggable [`Authenticator`], and publishes events to every
//! channel bound to a thread with [`Broker::broadcast`].

#![deny(unsafe_code)]

pub mod auth;
pub mod broker;
pub mod errors;
pub mod event;

pub use auth::{AuthOutcome, Authenticator, OpenAuthenticator};
pub use broker::{BroadcastRequest, Broker, ConnectionRecord};
pub use errors::BrokerError;
pub use event::BrokerEvent;

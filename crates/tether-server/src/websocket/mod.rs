//! `WebSocket` gateway: per-socket session, writer and heartbeat.

pub mod session;
pub mod writer;

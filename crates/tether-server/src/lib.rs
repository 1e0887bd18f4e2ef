//! # tether-server
//!
//! Axum HTTP + `WebSocket` gateway for the tether transport.
//!
//! - `GET {path}`: `WebSocket` upgrade; every socket becomes a server-side
//!   channel tracked by the [`Broker`](tether_broker::Broker)
//! - `GET /health`, `GET /metrics`: liveness and Prometheus text
//! - `POST /broadcast`: publish an event to every channel bound to a thread
//! - Heartbeat pings, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

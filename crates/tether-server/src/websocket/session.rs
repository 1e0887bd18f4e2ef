//! `WebSocket` session lifecycle: one accepted socket from upgrade through
//! close.
//!
//! The socket is split. The writer half runs [`run_writer`]. The reader half
//! turns socket messages into [`TransportEvent`]s for the channel worker. The
//! channel itself is tracked by the broker for the lifetime of the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tether_channel::{Channel, QueuedTransport, ReadyState, RequestInfo, TransportEvent, worker};
use tether_core::{ChannelId, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::writer::{Heartbeat, WriterExit, run_writer};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// Close code for a connection that vanished without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code for a close frame without a status.
const NO_STATUS: u16 = 1005;

/// Run a session for an accepted socket.
#[instrument(skip_all, fields(channel_id = %channel_id))]
pub async fn run_session(
    ws: WebSocket,
    channel_id: ChannelId,
    request: RequestInfo,
    state: AppState,
) {
    let config = &state.config;
    let (ws_tx, mut ws_rx) = ws.split();

    let origin = request.origin.clone();
    let (transport, outbound) = QueuedTransport::new(config.outbound_queue_size);
    let channel = Channel::server(channel_id.clone(), transport.clone(), request, config.channel);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size);
    let worker = worker::spawn(channel.clone(), inbound_rx);

    if !state.broker.add_channel(channel.clone()) {
        warn!("channel id collision, dropping socket");
        return;
    }

    let started = Instant::now();
    info!(origin = origin.as_deref().unwrap_or("-"), "channel opened");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let mut writer = tokio::spawn(run_writer(
        ws_tx,
        outbound,
        last_pong.clone(),
        Heartbeat {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
        },
        state.shutdown.token().child_token(),
    ));

    let (code, reason) = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(s) = std::str::from_utf8(&data) {
                            s.to_owned()
                        } else {
                            debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        *last_pong.lock() = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("peer sent close frame");
                        break frame.map_or((NO_STATUS, String::new()), |f| {
                            (f.code, f.reason.to_string())
                        });
                    }
                    Some(Err(e)) => {
                        let _ = inbound_tx
                            .send(TransportEvent::Error(TransportError::Send(e.to_string())))
                            .await;
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, "connection dropped".to_owned()),
                };
                if inbound_tx.send(TransportEvent::Message(text)).await.is_err() {
                    break (ABNORMAL_CLOSURE, "channel worker stopped".to_owned());
                }
            }
            exit = &mut writer => {
                let exit = exit.unwrap_or(WriterExit::QueueClosed);
                debug!(?exit, "writer stopped");
                break exit.close_status();
            }
        }
    };

    writer.abort();
    transport.set_ready_state(ReadyState::Closed);
    let _ = inbound_tx
        .send(TransportEvent::Close {
            code,
            reason: reason.clone(),
        })
        .await;
    drop(inbound_tx);
    if let Err(e) = worker.await {
        warn!(error = %e, "channel worker failed");
        // the worker never reported the close, so the broker still tracks us
        channel.handle_close(code, &reason);
    }

    info!(code, %reason, "channel closed");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

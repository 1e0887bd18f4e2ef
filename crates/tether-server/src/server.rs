//! `TetherServer`: Axum HTTP + `WebSocket` server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_broker::{BroadcastRequest, Broker};
use tether_channel::RequestInfo;
use tether_core::{ChannelId, EventBody, ThreadUid};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::{HTTP_BROADCASTS_TOTAL, WS_CONNECTIONS_REFUSED_TOTAL};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Multiplexer owning every server-side channel.
    pub broker: Broker,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The tether server.
pub struct TetherServer {
    config: Arc<ServerConfig>,
    broker: Broker,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl TetherServer {
    /// Create a new server around `broker`.
    pub fn new(config: ServerConfig, broker: Broker) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/broadcast", post(broadcast_handler))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve in the background.
    ///
    /// Returns the bound address and the serving task, which ends after the
    /// shutdown token is cancelled.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, path = %self.config.path, "tether server listening");
        Ok((addr, handle))
    }

    /// The broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET {path}: `WebSocket` upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.broker.channel_count() >= state.config.max_connections {
        warn!(max = state.config.max_connections, "connection limit reached, refusing socket");
        counter!(WS_CONNECTIONS_REFUSED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let request = request_info(&method, &uri, &headers);
    let channel_id = ChannelId::new();
    let session_state = state.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            state
                .shutdown
                .track_session(run_session(socket, channel_id, request, session_state))
        })
}

/// Capture the upgrade request for the authenticator.
fn request_info(method: &Method, uri: &Uri, headers: &HeaderMap) -> RequestInfo {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();
    RequestInfo {
        method: method.to_string(),
        uri: uri.to_string(),
        origin: headers.get(header::ORIGIN.as_str()).cloned(),
        headers,
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broker.channel_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Body of `POST /broadcast`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    /// Thread to publish to.
    pub uid: ThreadUid,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event subtype.
    #[serde(default)]
    pub subtype: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Whether receivers must answer.
    #[serde(default)]
    pub require_answer: bool,
    /// Deliver only to these channels.
    #[serde(default)]
    pub whitelist: Option<Vec<ChannelId>>,
    /// Never deliver to these channels.
    #[serde(default)]
    pub blacklist: Option<Vec<ChannelId>>,
}

impl From<BroadcastPayload> for BroadcastRequest {
    fn from(p: BroadcastPayload) -> Self {
        let mut body = EventBody::new(p.uid, p.kind, p.payload);
        body.subtype = p.subtype;
        body.require_answer = p.require_answer;
        let mut request = BroadcastRequest::new(body);
        if let Some(ids) = p.whitelist {
            request = request.only(ids);
        }
        if let Some(ids) = p.blacklist {
            request = request.except(ids);
        }
        request
    }
}

/// Response of `POST /broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// Channels that accepted the event.
    pub delivered: Vec<ChannelId>,
}

/// POST /broadcast
async fn broadcast_handler(
    State(state): State<AppState>,
    Json(payload): Json<BroadcastPayload>,
) -> Json<BroadcastResponse> {
    counter!(HTTP_BROADCASTS_TOTAL).increment(1);
    let delivered = state.broker.broadcast(payload.into()).await;
    Json(BroadcastResponse { delivered })
}

//! `RelayServer`: axum HTTP and WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::protocol::{CREATE_PATH, JOIN_PATH};
use relay_core::{RelayError, SessionId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::handlers::{record_rejection, Relay};
use crate::health::HealthResponse;
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::WsConnection;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session relay behind both upgrade routes.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown signal, reported by `/health`.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle rendered by `/metrics`.
    pub metrics: PrometheusHandle,
    /// Process start, for uptime.
    pub start_time: Instant,
}

/// `?sessionId=` on both upgrade endpoints.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    /// Raw value, validated by [`SessionId::parse`].
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// The relay's HTTP front end: routes, listener and shutdown.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    relay: Arc<Relay>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl RelayServer {
    /// Server for `config`, rendering metrics through `metrics`.
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        Self {
            relay: Arc::new(Relay::new(&config)),
            config: Arc::new(config),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Routes with tracing and CORS layers applied.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route(CREATE_PATH, get(create_handler))
            .route(JOIN_PATH, get(join_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// The relay serving both roles.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Cancelling this stops the listener and every session.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bind and serve in a background task.
    ///
    /// Cancelling the shutdown token terminates every session, then lets
    /// axum drain in-flight HTTP requests.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        let registry = Arc::clone(self.relay.registry());

        let handle = tokio::spawn(async move {
            let signal = async move {
                token.cancelled().await;
                let closed = registry.shutdown_all();
                info!(closed, "stopped accepting connections");
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "relay listening");
        Ok((addr, handle))
    }
}

/// GET /create?sessionId=
async fn create_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = match SessionId::parse(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(e) => return refuse(StatusCode::BAD_REQUEST, &e),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let relay = Arc::clone(&state.relay);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let _ = relay.create(id, WsConnection::new(socket)).await;
        })
}

/// GET /join?sessionId=
async fn join_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let id = match SessionId::parse(query.session_id.as_deref()) {
        Ok(id) => id,
        Err(e) => return refuse(StatusCode::BAD_REQUEST, &e),
    };
    if let Err(e) = state.relay.registry().lookup(&id) {
        return refuse(StatusCode::NOT_FOUND, &e);
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let relay = Arc::clone(&state.relay);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            // Already logged and counted when the session vanished mid-upgrade.
            let _ = relay.join(&id, WsConnection::new(socket)).await;
        })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.relay.registry();
    Json(HealthResponse::new(
        state.start_time,
        registry.session_count(),
        registry.subscriber_count(),
        state.shutdown.is_shutting_down(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&state.metrics),
    )
}

fn refuse(status: StatusCode, err: &RelayError) -> Response {
    record_rejection(err);
    let body = ErrorBody {
        error: err.kind(),
        message: err.to_string(),
    };
    (status, Json(body)).into_response()
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use demorelay_core::DecoderFactory;
use demorelay_telemetry::{Counters, TelemetryGuard};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bindings::ConnectionBindings;
use crate::client::{self, ConnectionContext, ConnectionRegistry};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub bindings: Arc<ConnectionBindings>,
    pub connections: Arc<ConnectionRegistry>,
    pub counters: Arc<Counters>,
    pub shutdown: ShutdownCoordinator,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn DecoderFactory>,
        counters: Arc<Counters>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let bindings = Arc::new(ConnectionBindings::new());
        let dispatcher = Arc::new(Dispatcher::new(factory, Arc::clone(&bindings), Arc::clone(&counters)));
        Self {
            dispatcher,
            bindings,
            connections: Arc::new(ConnectionRegistry::new(config.max_send_queue)),
            counters,
            shutdown,
            config: Arc::new(config),
        }
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: Arc::clone(&self.connections),
            bindings: Arc::clone(&self.bindings),
            dispatcher: Arc::clone(&self.dispatcher),
            counters: Arc::clone(&self.counters),
            shutdown: self.shutdown.clone(),
            heartbeat_interval: self.config.heartbeat_interval(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. Returns once the listener is up.
pub async fn start(
    config: ServerConfig,
    factory: Arc<dyn DecoderFactory>,
    telemetry: &TelemetryGuard,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = ShutdownCoordinator::new();
    let addr = config.bind_addr();
    let state = AppState::new(config, factory, Arc::clone(telemetry.counters()), shutdown.clone());

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "demorelay server started");

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Keeps the listener task and the shutdown
/// token together.
pub struct ServerHandle {
    pub port: u16,
    shutdown: ShutdownCoordinator,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Token cancelled by the `shutdown` task or by [`ServerHandle::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Stop accepting connections and wait for the listener to exit.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown
            .graceful_shutdown(vec![self.server], Some(timeout))
            .await;
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection, rx) = state.connections.register();
    tracing::info!(connection_id = %connection.id, "WebSocket client connected");
    client::handle_ws_connection(socket, connection, rx, state.connection_context()).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.dispatcher.driver().store().len(),
        "connections": state.connections.count(),
        "counters": state.counters.snapshot(),
    }))
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use demorelay_core::ConnectionId;
use demorelay_engine::sink::ERROR;
use demorelay_telemetry::{CounterName, Counters};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::bindings::{Binding, ConnectionBindings, FrameKind, Outbound};
use crate::command::Envelope;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::shutdown::ShutdownCoordinator;

/// Time allowed for queued frames to flush once the read side is done.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected WebSocket client.
pub struct Connection {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<Outbound>,
    last_pong: AtomicU64,
    busy: AtomicBool,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            last_pong: AtomicU64::new(now_secs()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    /// Pongs are not read while a command runs, so a busy connection
    /// counts as alive.
    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        if self.busy.load(Ordering::Relaxed) {
            return true;
        }
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return it with its outbound queue.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        let connection = Arc::new(Connection::new(id.clone(), tx));
        self.connections.insert(id, Arc::clone(&connection));
        (connection, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Everything a connection loop needs from the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub bindings: Arc<ConnectionBindings>,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<Counters>,
    pub shutdown: ShutdownCoordinator,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Drive one WebSocket connection.
///
/// A writer task drains the outbound queue and sends heartbeat pings. This
/// task reads one message at a time and dispatches it to completion on the
/// blocking pool before reading the next.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection: Arc<Connection>,
    mut rx: mpsc::Receiver<Outbound>,
    ctx: ConnectionContext,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&connection);
    let heartbeat_interval = ctx.heartbeat_interval;
    let heartbeat_timeout = ctx.heartbeat_timeout;
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let frame = match msg {
                        Some(Outbound::Text(text)) => WsMessage::Text(text.into()),
                        Some(Outbound::Binary(bytes)) => WsMessage::Binary(bytes),
                        Some(Outbound::Close) | None => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    };
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !writer_conn.is_alive(heartbeat_timeout) {
                        tracing::info!(connection_id = %writer_conn.id, "Heartbeat timed out");
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_conn.id, "Sent ping");
                }
            }
        }
    });

    let shutdown = ctx.shutdown.clone();
    let mut writer_done = false;
    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            _ = shutdown.requested() => break,
        };

        let (text, kind) = match msg {
            Some(Ok(WsMessage::Text(text))) => (text.to_string(), FrameKind::Text),
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => (text, FrameKind::Binary),
                Err(e) => {
                    reject_invalid(&ctx, &connection, FrameKind::Binary, &e).await;
                    continue;
                }
            },
            Some(Ok(WsMessage::Pong(_))) => {
                connection.record_pong();
                continue;
            }
            Some(Ok(WsMessage::Ping(_))) => continue, // axum answers pings
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection.id, error = %e, "Read failed");
                break;
            }
        };

        if handle_message(&ctx, &connection, text, kind).await == DispatchOutcome::Shutdown {
            ctx.shutdown.shutdown();
            break;
        }
    }

    let released = ctx.bindings.release(&connection.id);
    ctx.registry.unregister(&connection.id);
    if !writer_done {
        let _ = connection.tx.send(Outbound::Close).await;
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer).await;
    }
    tracing::info!(connection_id = %connection.id, released, "WebSocket client disconnected");
}

async fn handle_message(
    ctx: &ConnectionContext,
    connection: &Connection,
    text: String,
    kind: FrameKind,
) -> DispatchOutcome {
    let envelope = match Envelope::parse(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            reject_invalid(ctx, connection, kind, &e).await;
            return DispatchOutcome::Continue;
        }
    };

    ctx.bindings.bind(
        envelope.key.clone(),
        Binding {
            connection_id: connection.id.clone(),
            tx: connection.tx.clone(),
            kind,
        },
    );

    let dispatcher = Arc::clone(&ctx.dispatcher);
    let Envelope { key, task } = envelope;
    connection.set_busy(true);
    let result = tokio::task::spawn_blocking(move || dispatcher.dispatch(&key, &task)).await;
    connection.set_busy(false);
    connection.record_pong();
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(connection_id = %connection.id, error = %e, "Dispatch task failed");
            DispatchOutcome::Continue
        }
    }
}

/// Reply `Error` to a message that never reached a session.
async fn reject_invalid(
    ctx: &ConnectionContext,
    connection: &Connection,
    kind: FrameKind,
    error: &(dyn std::fmt::Display + Sync),
) {
    tracing::warn!(connection_id = %connection.id, error = %error, "Invalid message");
    ctx.counters.incr(CounterName::CallerErrors);
    let _ = connection.tx.send(Outbound::framed(kind, ERROR)).await;
}

//! # peercall-relay
//!
//! Signaling relay for peercall. Handles:
//! - Identity registration (`register` binds an id to the connection)
//! - Forwarding `call`, `answer` and `ice` messages to the connection
//!   registered under `to`
//! - Cleanup on disconnect
//!
//! The relay never interprets session descriptions or candidates. It only
//! checks that a frame is a well-formed signaling message before forwarding
//! it verbatim.

pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use peercall_call::signaling::{self, SignalMessage};
use peercall_common::config::RelayConfig;
use registry::{Outbox, Registry, RegistryStats};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Relay errors surfaced to the binary.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
}

/// Relay state shared by every connection.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<Registry>,
    max_frame_bytes: usize,
    outbox_capacity: usize,
    connections: Arc<AtomicUsize>,
    forwarded: Arc<AtomicU64>,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            max_frame_bytes: config.max_frame_bytes,
            outbox_capacity: config.outbox_capacity.max(1),
            connections: Arc::new(AtomicUsize::new(0)),
            forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.connections.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            registry: self.registry.stats().await,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub connections: usize,
    pub forwarded: u64,
    pub registry: RegistryStats,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Registered { id: String, replaced: Option<Uuid> },
    Forwarded { kind: &'static str, to: String },
    UnknownTarget { to: String },
    OutboxFull { to: String },
    Malformed(String),
    Oversized(usize),
}

/// One WebSocket connection as the router sees it.
pub struct Connection {
    pub id: Uuid,
    pub outbox: Outbox,
    /// Identity this connection registered, if any.
    pub registered: Option<String>,
}

impl Connection {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox,
            registered: None,
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(config: &RelayConfig) -> Result<(), RelayError> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("📡 Relay listening on ws://{}/ws", listener.local_addr()?);
    axum::serve(listener, build_router(RelayState::new(config))).await?;
    Ok(())
}

async fn health(State(state): State<RelayState>) -> Json<RelayStats> {
    Json(state.stats().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Decode one text frame and act on it.
pub async fn route_frame(state: &RelayState, conn: &mut Connection, text: &str) -> RouteOutcome {
    if text.len() > state.max_frame_bytes {
        return RouteOutcome::Oversized(text.len());
    }
    let msg = match signaling::decode(text) {
        Ok(msg) => msg,
        Err(e) => return RouteOutcome::Malformed(e.to_string()),
    };

    if let SignalMessage::Register { from } = msg {
        if let Some(previous) = conn.registered.take() {
            if previous != from {
                state.registry.unregister(&previous, conn.id).await;
            }
        }
        let replaced = state
            .registry
            .register(&from, conn.id, conn.outbox.clone())
            .await;
        conn.registered = Some(from.clone());
        return RouteOutcome::Registered { id: from, replaced };
    }

    let to = msg.to().unwrap_or_default().to_string();

    let Some(target) = state.registry.lookup(&to).await else {
        return RouteOutcome::UnknownTarget { to };
    };
    match target.outbox.try_send(text.to_string()) {
        Ok(()) => {
            state.forwarded.fetch_add(1, Ordering::Relaxed);
            RouteOutcome::Forwarded { kind: msg.kind(), to }
        }
        Err(mpsc::error::TrySendError::Full(_)) => RouteOutcome::OutboxFull { to },
        Err(mpsc::error::TrySendError::Closed(_)) => RouteOutcome::UnknownTarget { to },
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<String>(state.outbox_capacity);
    let mut conn = Connection::new(outbox);
    state.connections.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(connection = %conn.id, "Relay connection opened");

    // ── Sender task ──────────────────────────────────────────────────────────
    let send_task = tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match route_frame(&state, &mut conn, text.as_str()).await {
            RouteOutcome::Registered { id, replaced } => {
                tracing::info!(connection = %conn.id, id = %id, replaced = ?replaced, "Endpoint registered");
            }
            RouteOutcome::Forwarded { kind, to } => {
                tracing::debug!(connection = %conn.id, kind, to = %to, "Forwarded message");
            }
            RouteOutcome::UnknownTarget { to } => {
                tracing::warn!(connection = %conn.id, to = %to, "No endpoint registered for target");
            }
            RouteOutcome::OutboxFull { to } => {
                tracing::warn!(connection = %conn.id, to = %to, "Target outbox full, message dropped");
            }
            RouteOutcome::Malformed(error) => {
                tracing::warn!(connection = %conn.id, error = %error, "Ignoring malformed frame");
            }
            RouteOutcome::Oversized(len) => {
                tracing::warn!(connection = %conn.id, len, limit = state.max_frame_bytes, "Ignoring oversized frame");
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    if let Some(id) = conn.registered.take() {
        if state.registry.unregister(&id, conn.id).await {
            tracing::info!(connection = %conn.id, id = %id, "Endpoint unregistered");
        }
    }
    state.connections.fetch_sub(1, Ordering::Relaxed);
    send_task.abort();
    tracing::debug!(connection = %conn.id, "Relay connection closed");
}

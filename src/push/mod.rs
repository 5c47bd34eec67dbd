//! Push channel: token-keyed connection registry, per-connection
//! heartbeat, and the WebSocket handshake.
//!
//! Delivery is at-most-once and best-effort; the authoritative state is
//! always retrievable by polling the status routes.

use crate::config::HeartbeatConfig;
use crate::events::ServerEvent;
use crate::session::Peek;
use crate::state::ApiState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Close codes a client can tell apart to decide whether to reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SHUTDOWN: u16 = 1001;
pub const CLOSE_INVALID_TOKEN: u16 = 4001;
pub const CLOSE_SESSION_EXPIRED: u16 = 4002;
pub const CLOSE_LOGGED_OUT: u16 = 4003;

/// Messages the registry pushes into a connection's socket task.
#[derive(Debug)]
pub enum Outbound {
    Event(String),
    Ping,
    Close { code: u16, reason: &'static str },
}

struct ConnectionEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    /// Set when a ping goes out, cleared by the pong.
    awaiting_pong: Arc<AtomicBool>,
}

/// Live set of push-subscriber connections, keyed by session token.
/// One token may have several simultaneous connections (multiple tabs).
pub struct ConnectionRegistry {
    /// Back-reference handed to the per-connection heartbeat tasks.
    me: std::sync::Weak<Self>,
    connections: Mutex<HashMap<String, Vec<ConnectionEntry>>>,
    next_id: AtomicU64,
    heartbeat: HeartbeatConfig,
}

impl ConnectionRegistry {
    pub fn new(heartbeat: HeartbeatConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            heartbeat,
        })
    }

    /// Add a connection under the token and start its heartbeat cycle.
    pub fn register(&self, token: &str, tx: mpsc::UnboundedSender<Outbound>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let awaiting_pong = Arc::new(AtomicBool::new(false));

        self.connections
            .lock()
            .entry(token.to_string())
            .or_default()
            .push(ConnectionEntry {
                id,
                tx: tx.clone(),
                awaiting_pong: Arc::clone(&awaiting_pong),
            });

        tracing::debug!("Push connection {} registered", id);
        self.spawn_heartbeat(id, tx, awaiting_pong);
        id
    }

    fn spawn_heartbeat(
        &self,
        id: u64,
        tx: mpsc::UnboundedSender<Outbound>,
        awaiting_pong: Arc<AtomicBool>,
    ) {
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        let interval = Duration::from_millis(self.heartbeat.interval_ms);
        let deadline = Duration::from_millis(self.heartbeat.pong_deadline_ms);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !registry.contains(id) {
                    break;
                }

                awaiting_pong.store(true, Ordering::SeqCst);
                if tx.send(Outbound::Ping).is_err() {
                    registry.deregister(id);
                    break;
                }

                tokio::time::sleep(deadline).await;
                if awaiting_pong.load(Ordering::SeqCst) {
                    tracing::info!("Push connection {} missed its pong, pruning", id);
                    let _ = tx.send(Outbound::Close {
                        code: CLOSE_SHUTDOWN,
                        reason: "heartbeat-timeout",
                    });
                    registry.deregister(id);
                    break;
                }
            }
        });
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections
            .lock()
            .values()
            .any(|entries| entries.iter().any(|e| e.id == id))
    }

    pub fn deregister(&self, id: u64) {
        let mut connections = self.connections.lock();
        for entries in connections.values_mut() {
            entries.retain(|e| e.id != id);
        }
        connections.retain(|_, entries| !entries.is_empty());
    }

    /// Clear the pending pong deadline for a connection.
    pub fn mark_pong(&self, id: u64) {
        let connections = self.connections.lock();
        for entries in connections.values() {
            if let Some(entry) = entries.iter().find(|e| e.id == id) {
                entry.awaiting_pong.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Send an event to every live connection under the token. The token
    /// itself is stripped: subscribers only learn their own events, never
    /// the routing key. Dead connections are skipped silently.
    pub fn route_all(&self, token: &str, event: &ServerEvent) {
        let payload = event.to_client_json().to_string();
        let connections = self.connections.lock();
        if let Some(entries) = connections.get(token) {
            for entry in entries {
                let _ = entry.tx.send(Outbound::Event(payload.clone()));
            }
        }
    }

    /// Close every connection under a token with a distinct reason code so
    /// the client can tell "logged out" from a transient drop.
    pub fn close_all_for(&self, token: &str, code: u16, reason: &'static str) {
        let entries = self.connections.lock().remove(token);
        if let Some(entries) = entries {
            tracing::info!(
                "Closing {} push connection(s): {}",
                entries.len(),
                reason
            );
            for entry in entries {
                let _ = entry.tx.send(Outbound::Close { code, reason });
            }
        }
    }

    /// Close everything; server-initiated teardown.
    pub fn close_all(&self, code: u16, reason: &'static str) {
        let mut connections = self.connections.lock();
        for (_, entries) in connections.drain() {
            for entry in entries {
                let _ = entry.tx.send(Outbound::Close { code, reason });
            }
        }
    }

    pub fn connection_count(&self, token: &str) -> usize {
        self.connections
            .lock()
            .get(token)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

/// Wire the registry to the event bus: every published ServerEvent is
/// routed to the owning token's connections. Expired sessions get their
/// connections closed right after the event goes out. Called once at
/// process start.
pub fn wire_bus(bus: &crate::events::EventBus, registry: Arc<ConnectionRegistry>) {
    bus.subscribe_all(move |event| {
        registry.route_all(event.token(), event);
        if let ServerEvent::SessionExpired { token } = event {
            registry.close_all_for(token, CLOSE_SESSION_EXPIRED, "session-expired");
        }
    });
}

/// WebSocket upgrade handler for `/ws?token=...`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ApiState>,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Handle one push connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: ApiState, token: String) {
    let (mut sender, mut receiver) = socket.split();

    // Auth failure closes with a code the client can distinguish.
    let rejection = match state.sessions.peek(&token) {
        Peek::Unknown => Some((CLOSE_INVALID_TOKEN, "invalid-token")),
        Peek::Expired => Some((CLOSE_SESSION_EXPIRED, "session-expired")),
        Peek::Valid { .. } => {
            // The handshake is active use of the session.
            state.sessions.validate(&token);
            None
        }
    };
    if let Some((code, reason)) = rejection {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::from(reason),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = state.connections.register(&token, tx);

    // Forward registry messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outbound::Event(json) => sender.send(Message::Text(json)).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new())).await,
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::from(reason),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break; // client disconnected
            }
        }
    });

    // Pongs clear the heartbeat deadline; a close ends the connection.
    let registry = Arc::clone(&state.connections);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => registry.mark_pong(id),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.connections.deregister(id);
    tracing::debug!("Push connection {} closed", id);
}

//! WebSocket transport for the session coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐  handshake: Authorization: Bearer <jwt>
//!            ├── TokenVerifier ── UserDirectory ── (401 on failure)
//! Client B ──┘
//!      │ text frames {"destination": "document.*", "payload": {...}}
//!      ▼
//! SessionCoordinator ── ContentCache / PresenceTracker / PersistenceGate
//!      │
//!      ▼
//! BroadcastRouter ── /topic/document.<id>[.join|.leave]  (per-document topic)
//!                 └─ /user/queue/document.<id>.*         (per-user queue)
//!      │
//!      ▼  one forwarder task per subscription ─► mpsc ─► writer task
//! Client A / Client B / Client C
//! ```
//!
//! Each connection:
//! - Is bound to the username from its verified token; the `userId` of
//!   every inbound payload is overwritten with it
//! - Subscribes to its private queue on connect
//! - Subscribes to a document topic on the first load, join or update for
//!   that document, and unsubscribes on leave
//!
//! Disconnecting does not remove presence. Users stay active until they
//! leave or the optional idle reaper removes them.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{bearer_token, TokenVerifier};
use crate::broadcast::{BroadcastRouter, EventReceiver};
use crate::coordinator::{EventOutcome, SessionConfig, SessionCoordinator};
use crate::model::{DocumentId, UserRecord};
use crate::protocol::{ClientEvent, EventKind};
use crate::storage::{DocumentStore, UserDirectory};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Remove users idle this long (None = never)
    pub presence_idle_timeout: Option<Duration>,
    /// How often the idle reaper runs
    pub reaper_interval: Duration,
    /// Outgoing frames buffered per connection
    pub outgoing_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            presence_idle_timeout: None,
            reaper_interval: Duration::from_secs(30),
            outgoing_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Config for tests: the given address, small buffers.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broadcast_capacity: 64,
            presence_idle_timeout: None,
            reaper_interval: Duration::from_millis(50),
            outgoing_buffer: 64,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_received: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    messages_received: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

struct ServerState {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    users: Arc<dyn UserDirectory>,
    verifier: Arc<dyn TokenVerifier>,
    stats: AtomicServerStats,
}

/// The collaboration server.
#[derive(Clone)]
pub struct CollabServer {
    state: Arc<ServerState>,
}

impl CollabServer {
    /// Serve an existing coordinator.
    pub fn new(
        config: ServerConfig,
        coordinator: Arc<SessionCoordinator>,
        users: Arc<dyn UserDirectory>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                coordinator,
                users,
                verifier,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    /// Build the router and coordinator from configuration.
    pub fn build(
        config: ServerConfig,
        session: &SessionConfig,
        users: Arc<dyn UserDirectory>,
        documents: Arc<dyn DocumentStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let router = Arc::new(BroadcastRouter::new(config.broadcast_capacity));
        let coordinator = Arc::new(SessionCoordinator::with_config(
            users.clone(),
            documents,
            router,
            session,
        ));
        Self::new(config, coordinator, users, verifier)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        if let Some(timeout) = self.state.config.presence_idle_timeout {
            self.spawn_reaper(timeout);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_reaper(&self, timeout: Duration) -> JoinHandle<()> {
        let coordinator = self.state.coordinator.clone();
        let period = self.state.config.reaper_interval;
        log::info!("Presence reaper enabled: idle timeout {timeout:?}, every {period:?}");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let reaped = coordinator.reap_idle_sessions(timeout);
                if reaped > 0 {
                    log::info!("Reaped {reaped} idle sessions");
                }
            }
        })
    }

    /// Verify the bearer token and resolve its subject.
    fn authenticate(state: &ServerState, request: &Request) -> Option<UserRecord> {
        let header = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let claims = state.verifier.verify(bearer_token(header)?)?;
        match state.users.find_by_username(&claims.sub) {
            Ok(user) => Some(user),
            Err(e) => {
                log::warn!("Token subject {} not resolvable: {e}", claims.sub);
                None
            }
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
    ) -> Result<(), ServerError> {
        let mut authenticated: Option<UserRecord> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match Self::authenticate(&state, request) {
                Some(user) => {
                    authenticated = Some(user);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if authenticated.is_none() {
                    state.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Rejected unauthenticated handshake from {addr}");
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        let Some(user) = authenticated else {
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr} as {}", user.username);
        state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        state.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(state.config.outgoing_buffer);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let router = state.coordinator.router().clone();
        let private = spawn_forwarder(router.subscribe_user(&user.id), out_tx.clone());
        let mut topics: HashMap<DocumentId, JoinHandle<()>> = HashMap::new();

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    state.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let mut event = match ClientEvent::decode(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    event.message.user_id = user.username.clone();
                    let document_id = event.message.document_id.clone();

                    if event.kind == EventKind::Leave {
                        if let Some(forwarder) = topics.remove(&document_id) {
                            forwarder.abort();
                        }
                    } else if !topics.contains_key(&document_id) {
                        let rx = router.subscribe_document(&document_id);
                        topics.insert(document_id.clone(), spawn_forwarder(rx, out_tx.clone()));
                    }

                    match state.coordinator.handle(&event) {
                        EventOutcome::Delivered { .. } => {
                            state.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        EventOutcome::Dropped(reason) => {
                            state.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                            log::debug!("{} from {} dropped: {reason}", event.kind, user.username);
                        }
                    }

                    if event.kind == EventKind::Leave {
                        router.remove_if_idle(&document_id);
                    }
                }

                Ok(Message::Ping(data)) => {
                    if out_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }

                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }

                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }

                _ => {}
            }
        }

        // Cleanup: stop forwarding; presence is left to leave or the reaper
        private.abort();
        for (document_id, forwarder) in topics.drain() {
            forwarder.abort();
            // An aborted task drops its receiver once it is polled again
            let _ = forwarder.await;
            router.remove_if_idle(&document_id);
        }
        let _ = private.await;
        router.remove_user_if_idle(&user.id);
        drop(out_tx);
        let _ = writer.await;

        state.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} ({}) finished", user.username);
        Ok(())
    }

    /// Snapshot of server statistics.
    pub fn stats(&self) -> ServerStats {
        let stats = &self.state.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            events_delivered: stats.events_delivered.load(Ordering::Relaxed),
            events_dropped: stats.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.state.coordinator
    }
}

/// Forward one subscription into the connection's outgoing channel.
fn spawn_forwarder(mut rx: EventReceiver, out_tx: mpsc::Sender<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let text = match event.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("Failed to encode {}: {e}", event.destination());
                            continue;
                        }
                    };
                    if out_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Subscriber lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle with a bearer token on the handshake
//! - Typed senders for load, update, join and leave
//! - An event channel carrying decoded server events
//!
//! The server overwrites `userId` on every inbound payload, so the client
//! never sends one.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::model::now_millis;
use crate::protocol::{ClientEvent, DocumentUpdateMessage, EventKind, ProtocolError, ServerEvent};

/// Bound on TCP connect plus the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// A frame from a document topic or the private queue
    Message(ServerEvent),
}

pub struct CollabClient {
    server_url: String,
    token: String,
    connect_timeout: Duration,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SessionEvent>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let opened = match tokio::time::timeout(self.connect_timeout, self.open()).await {
            Ok(opened) => opened,
            Err(_) => {
                log::warn!(
                    "Handshake with {} timed out after {:?}",
                    self.server_url,
                    self.connect_timeout
                );
                Err(ProtocolError::Timeout)
            }
        };
        let ws_stream = match opened {
            Ok(ws) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(SessionEvent::Message(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn open(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        ProtocolError,
    > {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        Ok(ws_stream)
    }

    /// Send one event. Fails when not connected.
    pub async fn send(&self, kind: EventKind, document_id: &str, content: &str) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let message = DocumentUpdateMessage::new(document_id, content, "", now_millis());
        let text = ClientEvent::new(kind, message).encode()?;

        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(Message::Text(text.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn load(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.send(EventKind::Load, document_id, "").await
    }

    pub async fn update(&self, document_id: &str, content: &str) -> Result<(), ProtocolError> {
        self.send(EventKind::Update, document_id, content).await
    }

    pub async fn join(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.send(EventKind::Join, document_id, "").await
    }

    pub async fn leave(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.send(EventKind::Leave, document_id, "").await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

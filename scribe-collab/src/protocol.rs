//! JSON wire protocol for the session layer.
//!
//! Every WebSocket text frame is an envelope naming a destination:
//! ```text
//! client → server   {"destination": "document.update", "payload": {documentId, content, userId, timestamp}}
//!
//! server → client   /topic/document.<id>                 update message
//!                   /topic/document.<id>.join            joining user id
//!                   /topic/document.<id>.leave           leaving user id
//!                   /user/queue/document.<id>.content    content message (sender "system")
//!                   /user/queue/document.<id>.users      sorted active user ids
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{DocumentId, UserId};

const TOPIC_PREFIX: &str = "/topic/document.";
const QUEUE_PREFIX: &str = "/user/queue/document.";

/// The four inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Load,
    Update,
    Join,
    Leave,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Load,
        EventKind::Update,
        EventKind::Join,
        EventKind::Leave,
    ];

    /// Inbound destination name.
    pub fn destination(&self) -> &'static str {
        match self {
            EventKind::Load => "document.load",
            EventKind::Update => "document.update",
            EventKind::Join => "document.join",
            EventKind::Leave => "document.leave",
        }
    }

    pub fn from_destination(destination: &str) -> Option<Self> {
        // Tolerate an application prefix such as "/app/document.update"
        let name = destination.rsplit('/').next().unwrap_or(destination);
        Self::ALL.into_iter().find(|kind| kind.destination() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.destination())
    }
}

/// Payload shared by every inbound event and by content pushes.
///
/// `user_id` carries a username on the way in and may be the sentinel
/// `"system"` on the way out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdateMessage {
    pub document_id: DocumentId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub user_id: String,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: u64,
}

impl DocumentUpdateMessage {
    pub fn new(
        document_id: impl Into<DocumentId>,
        content: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            content: content.into(),
            user_id: user_id.into(),
            timestamp,
        }
    }
}

/// Raw inbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub destination: String,
    pub payload: DocumentUpdateMessage,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub kind: EventKind,
    pub message: DocumentUpdateMessage,
}

impl ClientEvent {
    pub fn new(kind: EventKind, message: DocumentUpdateMessage) -> Self {
        Self { kind, message }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let frame = ClientFrame {
            destination: self.kind.destination().to_string(),
            payload: self.message.clone(),
        };
        serde_json::to_string(&frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let kind = EventKind::from_destination(&frame.destination)
            .ok_or(ProtocolError::UnknownDestination(frame.destination))?;
        Ok(Self {
            kind,
            message: frame.payload,
        })
    }
}

/// Outbound events, routed either to a document topic or to a user's
/// private queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Accepted edit, rebroadcast as received
    Update(DocumentUpdateMessage),
    Joined {
        document_id: DocumentId,
        user_id: UserId,
    },
    Left {
        document_id: DocumentId,
        user_id: UserId,
    },
    /// Private content push
    Content(DocumentUpdateMessage),
    /// Private snapshot of active users, sorted
    ActiveUsers {
        document_id: DocumentId,
        users: Vec<UserId>,
    },
}

impl ServerEvent {
    pub fn document_id(&self) -> &str {
        match self {
            ServerEvent::Update(msg) | ServerEvent::Content(msg) => &msg.document_id,
            ServerEvent::Joined { document_id, .. }
            | ServerEvent::Left { document_id, .. }
            | ServerEvent::ActiveUsers { document_id, .. } => document_id,
        }
    }

    /// Whether this event travels on a user's private queue.
    pub fn is_private(&self) -> bool {
        matches!(self, ServerEvent::Content(_) | ServerEvent::ActiveUsers { .. })
    }

    pub fn destination(&self) -> String {
        let id = self.document_id();
        match self {
            ServerEvent::Update(_) => format!("{TOPIC_PREFIX}{id}"),
            ServerEvent::Joined { .. } => format!("{TOPIC_PREFIX}{id}.join"),
            ServerEvent::Left { .. } => format!("{TOPIC_PREFIX}{id}.leave"),
            ServerEvent::Content(_) => format!("{QUEUE_PREFIX}{id}.content"),
            ServerEvent::ActiveUsers { .. } => format!("{QUEUE_PREFIX}{id}.users"),
        }
    }

    pub fn to_frame(&self) -> Result<ServerFrame, ProtocolError> {
        let payload = match self {
            ServerEvent::Update(msg) | ServerEvent::Content(msg) => serde_json::to_value(msg),
            ServerEvent::Joined { user_id, .. } | ServerEvent::Left { user_id, .. } => {
                serde_json::to_value(user_id)
            }
            ServerEvent::ActiveUsers { users, .. } => serde_json::to_value(users),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        Ok(ServerFrame {
            destination: self.destination(),
            payload,
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(&self.to_frame()?)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: ServerFrame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        frame.into_event()
    }
}

/// Raw outbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub destination: String,
    pub payload: serde_json::Value,
}

impl ServerFrame {
    pub fn into_event(self) -> Result<ServerEvent, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            value: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
        }

        if let Some(rest) = self.destination.strip_prefix(TOPIC_PREFIX) {
            if let Some(id) = rest.strip_suffix(".join") {
                return Ok(ServerEvent::Joined {
                    document_id: id.to_string(),
                    user_id: payload(self.payload)?,
                });
            }
            if let Some(id) = rest.strip_suffix(".leave") {
                return Ok(ServerEvent::Left {
                    document_id: id.to_string(),
                    user_id: payload(self.payload)?,
                });
            }
            return Ok(ServerEvent::Update(payload(self.payload)?));
        }

        if let Some(rest) = self.destination.strip_prefix(QUEUE_PREFIX) {
            if rest.ends_with(".content") {
                return Ok(ServerEvent::Content(payload(self.payload)?));
            }
            if let Some(id) = rest.strip_suffix(".users") {
                return Ok(ServerEvent::ActiveUsers {
                    document_id: id.to_string(),
                    users: payload(self.payload)?,
                });
            }
        }

        Err(ProtocolError::UnknownDestination(self.destination))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_client_frame() {
        let text = r#"{"destination":"document.update","payload":{"documentId":"d1","content":"hi","userId":"alice","timestamp":5}}"#;
        let event = ClientEvent::decode(text).unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.message, DocumentUpdateMessage::new("d1", "hi", "alice", 5));
    }

    #[test]
    fn test_decode_client_frame_with_app_prefix_and_missing_fields() {
        let text = r#"{"destination":"/app/document.join","payload":{"documentId":"d1"}}"#;
        let event = ClientEvent::decode(text).unwrap();
        assert_eq!(event.kind, EventKind::Join);
        assert_eq!(event.message.content, "");
        assert_eq!(event.message.timestamp, 0);
    }

    #[test]
    fn test_decode_unknown_destination() {
        let text = r#"{"destination":"document.delete","payload":{"documentId":"d1"}}"#;
        assert_eq!(
            ClientEvent::decode(text),
            Err(ProtocolError::UnknownDestination("document.delete".into()))
        );
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            ClientEvent::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_event_kind_destinations() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_destination(kind.destination()), Some(kind));
        }
        assert_eq!(EventKind::Leave.to_string(), "document.leave");
    }

    #[test]
    fn test_server_destinations() {
        let msg = DocumentUpdateMessage::new("d1", "x", "alice", 1);
        assert_eq!(ServerEvent::Update(msg.clone()).destination(), "/topic/document.d1");
        assert_eq!(
            ServerEvent::Content(msg).destination(),
            "/user/queue/document.d1.content"
        );
        let joined = ServerEvent::Joined {
            document_id: "d1".into(),
            user_id: "u1".into(),
        };
        assert_eq!(joined.destination(), "/topic/document.d1.join");
        assert!(!joined.is_private());
        let users = ServerEvent::ActiveUsers {
            document_id: "d1".into(),
            users: vec!["u1".into()],
        };
        assert_eq!(users.destination(), "/user/queue/document.d1.users");
        assert!(users.is_private());
    }

    #[test]
    fn test_update_frame_is_camel_case() {
        let event = ServerEvent::Update(DocumentUpdateMessage::new("d1", "x", "alice", 7));
        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["destination"], "/topic/document.d1");
        assert_eq!(value["payload"]["documentId"], "d1");
        assert_eq!(value["payload"]["userId"], "alice");
    }

    #[test]
    fn test_join_payload_is_bare_user_id() {
        let event = ServerEvent::Left {
            document_id: "d1".into(),
            user_id: "u9".into(),
        };
        let frame = event.to_frame().unwrap();
        assert_eq!(frame.payload, serde_json::json!("u9"));
        assert_eq!(ServerEvent::decode(&event.encode().unwrap()).unwrap(), event);
    }

    #[test]
    fn test_active_users_decode() {
        let text = r#"{"destination":"/user/queue/document.d1.users","payload":["a","b"]}"#;
        assert_eq!(
            ServerEvent::decode(text).unwrap(),
            ServerEvent::ActiveUsers {
                document_id: "d1".into(),
                users: vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn test_server_frame_unknown_destination() {
        let text = r#"{"destination":"/topic/other","payload":null}"#;
        assert!(matches!(
            ServerEvent::decode(text),
            Err(ProtocolError::UnknownDestination(_))
        ));
    }
}

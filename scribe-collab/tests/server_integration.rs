//! Integration tests for end-to-end WebSocket sessions.
//!
//! These tests start a real server and connect real clients with signed
//! tokens, verifying the full join → load → update → leave pipeline.

use scribe_collab::auth::{Hs256Issuer, Hs256Verifier};
use scribe_collab::client::{CollabClient, ConnectionState, SessionEvent};
use scribe_collab::coordinator::SessionConfig;
use scribe_collab::model::{AccessRole, DocumentRecord, UserRecord};
use scribe_collab::protocol::ServerEvent;
use scribe_collab::server::{CollabServer, ServerConfig};
use scribe_collab::storage::{DocumentStore, MemoryDocumentStore, MemoryUserDirectory};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite;

const SECRET: &str = "integration-secret";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port with alice (owner), bob (viewer) and
/// carol (editor) on "d1".
async fn start_test_server() -> (CollabServer, String) {
    let port = free_port().await;
    let users = Arc::new(MemoryUserDirectory::with_users([
        UserRecord::new("a-id", "alice"),
        UserRecord::new("b-id", "bob"),
        UserRecord::new("c-id", "carol"),
    ]));
    let documents = Arc::new(MemoryDocumentStore::new());
    let mut doc = DocumentRecord::new("d1", "Notes", "hello", "a-id");
    doc.access_roles.insert("b-id".into(), AccessRole::Viewer);
    doc.access_roles.insert("c-id".into(), AccessRole::Editor);
    documents.save(doc).unwrap();

    let server = CollabServer::build(
        ServerConfig::for_testing(format!("127.0.0.1:{port}")),
        &SessionConfig::for_testing(),
        users,
        documents,
        Arc::new(Hs256Verifier::new(SECRET)),
    );
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn connect(url: &str, username: &str) -> (CollabClient, mpsc::Receiver<SessionEvent>) {
    let token = Hs256Issuer::new(SECRET).issue(username, 60).unwrap();
    let mut client = CollabClient::new(url, token);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SessionEvent::Connected)) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

/// Wait for the first server event matching `pred`, skipping others.
async fn next_matching<F>(events: &mut mpsc::Receiver<SessionEvent>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Message(event)) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    };
    timeout(Duration::from_secs(2), wait)
        .await
        .expect("Timed out waiting for event")
}

/// The next `count` server events, in arrival order.
async fn take_events(events: &mut mpsc::Receiver<SessionEvent>, count: usize) -> Vec<ServerEvent> {
    let mut taken = Vec::with_capacity(count);
    while taken.len() < count {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SessionEvent::Message(event))) => taken.push(event),
            Ok(Some(_)) => continue,
            other => panic!("Expected {count} events, got {taken:?} then {other:?}"),
        }
    }
    taken
}

/// True if no matching event arrives within `window`.
async fn none_matching<F>(events: &mut mpsc::Receiver<SessionEvent>, window: Duration, pred: F) -> bool
where
    F: Fn(&ServerEvent) -> bool,
{
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Message(event) = event {
                if pred(&event) {
                    return;
                }
            }
        }
        std::future::pending::<()>().await
    };
    timeout(window, wait).await.is_err()
}

#[tokio::test]
async fn test_join_load_update_leave() {
    let (server, url) = start_test_server().await;

    let (alice, mut alice_rx) = connect(&url, "alice").await;
    alice.join("d1").await.unwrap();

    // Topic and private queue are forwarded independently
    let first = take_events(&mut alice_rx, 2).await;
    assert!(first.contains(&ServerEvent::Joined {
        document_id: "d1".into(),
        user_id: "a-id".into(),
    }));
    assert!(first.contains(&ServerEvent::ActiveUsers {
        document_id: "d1".into(),
        users: vec!["a-id".into()],
    }));

    alice.load("d1").await.unwrap();
    match next_matching(&mut alice_rx, |e| matches!(e, ServerEvent::Content(_))).await {
        ServerEvent::Content(message) => {
            assert_eq!(message.content, "hello");
            assert_eq!(message.user_id, "system");
        }
        other => panic!("Expected content, got {other:?}"),
    }

    let (bob, mut bob_rx) = connect(&url, "bob").await;
    bob.join("d1").await.unwrap();
    next_matching(&mut alice_rx, |e| {
        matches!(e, ServerEvent::Joined { user_id, .. } if user_id == "b-id")
    })
    .await;
    match next_matching(&mut bob_rx, |e| matches!(e, ServerEvent::Content(_))).await {
        ServerEvent::Content(message) => assert_eq!(message.content, "hello"),
        other => panic!("Expected cached content, got {other:?}"),
    }

    alice.update("d1", "hello world").await.unwrap();
    match next_matching(&mut bob_rx, |e| matches!(e, ServerEvent::Update(_))).await {
        ServerEvent::Update(message) => {
            assert_eq!(message.content, "hello world");
            // Stamped with the authenticated username
            assert_eq!(message.user_id, "alice");
        }
        other => panic!("Expected update, got {other:?}"),
    }

    bob.leave("d1").await.unwrap();
    next_matching(&mut alice_rx, |e| {
        matches!(e, ServerEvent::Left { user_id, .. } if user_id == "b-id")
    })
    .await;

    let coordinator = server.coordinator();
    assert_eq!(coordinator.cache().get("d1").as_deref(), Some("hello world"));
    assert!(coordinator.presence().is_active("d1", "a-id"));
    assert!(!coordinator.presence().is_active("d1", "b-id"));
}

#[tokio::test]
async fn test_viewer_update_not_broadcast() {
    let (server, url) = start_test_server().await;

    let (alice, mut alice_rx) = connect(&url, "alice").await;
    alice.join("d1").await.unwrap();
    next_matching(&mut alice_rx, |e| matches!(e, ServerEvent::ActiveUsers { .. })).await;

    let (bob, _bob_rx) = connect(&url, "bob").await;
    bob.update("d1", "goodbye").await.unwrap();

    assert!(
        none_matching(&mut alice_rx, Duration::from_millis(200), |e| {
            matches!(e, ServerEvent::Update(_))
        })
        .await
    );
    assert_ne!(server.coordinator().cache().get("d1").as_deref(), Some("goodbye"));
    assert_eq!(server.stats().events_dropped, 1);
}

#[tokio::test]
async fn test_editor_updates_arrive_in_order() {
    let (_server, url) = start_test_server().await;

    let (alice, mut alice_rx) = connect(&url, "alice").await;
    alice.join("d1").await.unwrap();
    next_matching(&mut alice_rx, |e| matches!(e, ServerEvent::ActiveUsers { .. })).await;

    let (carol, _carol_rx) = connect(&url, "carol").await;
    for n in 0..20 {
        carol.update("d1", &format!("rev {n}")).await.unwrap();
    }

    for n in 0..20 {
        match next_matching(&mut alice_rx, |e| matches!(e, ServerEvent::Update(_))).await {
            ServerEvent::Update(message) => assert_eq!(message.content, format!("rev {n}")),
            other => panic!("Expected update, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_disconnect_keeps_presence() {
    let (server, url) = start_test_server().await;

    let (mut carol, mut carol_rx) = connect(&url, "carol").await;
    carol.join("d1").await.unwrap();
    next_matching(&mut carol_rx, |e| matches!(e, ServerEvent::ActiveUsers { .. })).await;

    carol.disconnect().await;
    assert_eq!(carol.connection_state().await, ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(server.coordinator().presence().is_active("d1", "c-id"));
    assert_eq!(server.stats().active_connections, 0);
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let (server, url) = start_test_server().await;

    match tokio_tungstenite::connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("Expected 401, got {:?}", other.map(|_| ())),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().rejected_handshakes, 1);
}

#[tokio::test]
async fn test_invalid_and_unknown_tokens_rejected() {
    let (server, url) = start_test_server().await;

    let forged = Hs256Issuer::new("wrong-secret").issue("alice", 60).unwrap();
    let mut client = CollabClient::new(&url, forged);
    assert!(client.connect().await.is_err());

    // Valid signature, but nobody by that name
    let stranger = Hs256Issuer::new(SECRET).issue("mallory", 60).unwrap();
    let mut client = CollabClient::new(&url, stranger);
    assert!(client.connect().await.is_err());
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().rejected_handshakes, 2);
    assert_eq!(server.stats().total_connections, 0);
}

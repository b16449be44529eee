//! Scribe collaboration server.
//!
//! Opens storage, seeds users and documents and serves WebSocket sessions.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scribe_collab::{
    CollabServer, DocumentRecord, DocumentService, DocumentStore, Hs256Issuer, Hs256Verifier,
    MemoryDocumentStore, MemoryUserDirectory, RocksDocumentStore, ServerConfig, SessionConfig,
    StoreConfig, UserDirectory, UserRecord,
};

#[derive(Parser)]
#[command(name = "scribe-server")]
#[command(about = "Live collaboration server for shared text documents")]
struct Cli {
    /// Listen address
    #[arg(short, long, env = "SCRIBE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; in-memory storage when omitted
    #[arg(short, long, env = "SCRIBE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HS256 secret for bearer tokens
    #[arg(long, env = "SCRIBE_JWT_SECRET")]
    jwt_secret: String,

    /// Probability that an accepted edit is persisted
    #[arg(long, env = "SCRIBE_PERSIST_PROBABILITY", default_value_t = 0.8)]
    persist_probability: f64,

    /// JSON array of users to seed into the directory
    #[arg(short, long, env = "SCRIBE_USERS")]
    users: Option<PathBuf>,

    /// JSON array of documents to create if absent; owners must be seeded users
    #[arg(long, env = "SCRIBE_DOCUMENTS")]
    documents: Option<PathBuf>,

    /// Remove users idle this many seconds; never when omitted
    #[arg(long, env = "SCRIBE_PRESENCE_TIMEOUT_SECS")]
    presence_timeout_secs: Option<u64>,

    /// Print a one-hour token for this username and exit
    #[arg(long)]
    issue_token: Option<String>,
}

fn load_users(path: &PathBuf) -> Result<Vec<UserRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading users file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing users file {}", path.display()))
}

fn parse_documents(text: &str) -> Result<Vec<DocumentRecord>> {
    Ok(serde_json::from_str(text)?)
}

/// Import every record that does not exist yet. Returns how many were new.
fn seed_documents(service: &DocumentService, records: Vec<DocumentRecord>) -> Result<usize> {
    let mut created = 0;
    for record in records {
        let id = record.id.clone();
        if service
            .import(record)
            .with_context(|| format!("seeding document {id}"))?
        {
            created += 1;
        }
    }
    Ok(created)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(username) = cli.issue_token {
        println!("{}", Hs256Issuer::new(&cli.jwt_secret).issue(&username, 3600)?);
        return Ok(());
    }

    let (documents, users): (Arc<dyn DocumentStore>, Arc<dyn UserDirectory>) = match cli.data_dir {
        Some(path) => {
            let store = Arc::new(RocksDocumentStore::open(StoreConfig {
                path,
                ..StoreConfig::default()
            })?);
            info!("Opened RocksDB store at {}", store.path().display());
            let documents: Arc<dyn DocumentStore> = store.clone();
            let users: Arc<dyn UserDirectory> = store;
            (documents, users)
        }
        None => {
            warn!("No data directory given, documents will not survive a restart");
            let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
            let users: Arc<dyn UserDirectory> = Arc::new(MemoryUserDirectory::new());
            (documents, users)
        }
    };

    if let Some(path) = cli.users.as_ref() {
        let seeded = load_users(path)?;
        let count = seeded.len();
        for user in seeded {
            users.save_user(user)?;
        }
        info!("Seeded {count} users from {}", path.display());
    }

    let config = ServerConfig {
        bind_addr: cli.bind,
        presence_idle_timeout: cli.presence_timeout_secs.map(Duration::from_secs),
        ..ServerConfig::default()
    };
    let session = SessionConfig {
        persist_probability: cli.persist_probability,
    };

    let server = CollabServer::build(
        config,
        &session,
        users.clone(),
        documents.clone(),
        Arc::new(Hs256Verifier::new(&cli.jwt_secret)),
    );
    let service = DocumentService::new(documents, users).with_sessions(server.coordinator().clone());

    if let Some(path) = cli.documents.as_ref() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading documents file {}", path.display()))?;
        let records = parse_documents(&text)
            .with_context(|| format!("parsing documents file {}", path.display()))?;
        let total = records.len();
        let created = seed_documents(&service, records)?;
        info!("Seeded {created} of {total} documents from {}", path.display());
    }

    info!("Starting Scribe server on {}", server.bind_addr());
    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_collab::AccessRole;

    const SEED: &str = r#"[
        {
            "id": "welcome",
            "title": "Welcome",
            "content": "hello",
            "ownerId": "a-id",
            "accessRoles": { "b-id": "editor" }
        },
        { "id": "scratch", "ownerId": "b-id" }
    ]"#;

    fn service() -> (DocumentService, Arc<MemoryUserDirectory>) {
        let users = Arc::new(MemoryUserDirectory::with_users([
            UserRecord::new("a-id", "alice"),
            UserRecord::new("b-id", "bob"),
        ]));
        let documents = Arc::new(MemoryDocumentStore::new());
        (DocumentService::new(documents, users.clone()), users)
    }

    #[test]
    fn test_parse_documents_fills_defaults() {
        let records = parse_documents(SEED).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role_of("b-id"), Some(AccessRole::Editor));
        assert_eq!(records[1].title, "");
        assert!(records[1].versions.is_empty());
        assert!(parse_documents("{").is_err());
    }

    #[test]
    fn test_seed_documents_is_idempotent() {
        let (service, users) = service();
        let records = parse_documents(SEED).unwrap();

        assert_eq!(seed_documents(&service, records.clone()).unwrap(), 2);
        assert_eq!(seed_documents(&service, records).unwrap(), 0);

        let welcome = service.get("bob", "welcome").unwrap();
        assert_eq!(welcome.content, "hello");
        assert_eq!(welcome.versions.len(), 1);
        assert!(users
            .find_by_id("b-id")
            .unwrap()
            .shared_document_ids
            .contains("welcome"));
        assert_eq!(service.documents_owned_by("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_seed_documents_rejects_unknown_owner() {
        let (service, _) = service();
        let records = parse_documents(r#"[{ "id": "x", "ownerId": "nobody" }]"#).unwrap();
        assert!(seed_documents(&service, records).is_err());
    }
}

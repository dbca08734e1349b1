//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /rooms/7/ws, x-user-id: 1
//!            ├── RoomRegistry ── Hub (room 7) ──► Client A, B, C queues
//! Client B ──┘        │
//!                     └── MessageRouter ── MutationService ── DocumentStore
//!                                                               │
//!                                              ┌────────────────┴──────┐
//!                                              ▼                       ▼
//!                                     MemoryDocumentStore    RocksDocumentStore
//! ```
//!
//! The front end in charge of sessions authenticates the user and forwards
//! the upgrade with an `x-user-id` header. The request path names the room.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite;

use crate::connection::{ClientConnection, ConnectionConfig};
use crate::hub::{HubConfig, RoomRegistry};
use crate::router::MessageRouter;
use crate::service::MutationService;
use crate::storage::{
    DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError,
};
use crate::{RoomId, UserId};

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Put full error text in NACK messages
    pub debug: bool,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            storage_path: None,
            debug: false,
            hub: HubConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
}

/// Why an upgrade request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("expected /rooms/<roomID>, got {0:?}")]
    BadPath(String),
    #[error("invalid room id {0:?}")]
    InvalidRoom(String),
    #[error("missing x-user-id header")]
    MissingUser,
    #[error("invalid user id {0:?}")]
    InvalidUser(String),
}

/// Resolve the room and user of an upgrade request.
pub fn parse_identity(path: &str, user: Option<&str>) -> Result<(RoomId, UserId), IdentityError> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let room = match segments.as_slice() {
        ["rooms", room] | ["rooms", room, "ws"] => *room,
        _ => return Err(IdentityError::BadPath(path.to_owned())),
    };
    let room_id = room
        .parse()
        .map_err(|_| IdentityError::InvalidRoom(room.to_owned()))?;

    let user = user.map(str::trim).ok_or(IdentityError::MissingUser)?;
    let user_id = user
        .parse()
        .map_err(|_| IdentityError::InvalidUser(user.to_owned()))?;

    Ok((room_id, user_id))
}

fn reject(reason: &IdentityError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Shared {
    rooms: Arc<RoomRegistry>,
    router: Arc<MessageRouter>,
    connection: ConnectionConfig,
    counters: Arc<Counters>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<dyn DocumentStore>,
    shared: Shared,
}

impl SyncServer {
    /// Create a server, opening RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksDocumentStore::open(store_config)?)
            }
            None => Arc::new(MemoryDocumentStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let service = MutationService::new(store.clone());
        let shared = Shared {
            rooms: Arc::new(RoomRegistry::new(config.hub.clone())),
            router: Arc::new(MessageRouter::new(service, config.debug)),
            connection: config.connection.clone(),
            counters: Arc::new(Counters::default()),
        };
        Self {
            config,
            store,
            shared,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        ServerStats {
            total_connections: counters.total.load(Ordering::Relaxed),
            active_connections: counters.active.load(Ordering::Relaxed),
            rejected_handshakes: counters.rejected.load(Ordering::Relaxed),
            active_rooms: self.shared.rooms.room_count().await,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), tungstenite::Error> {
        let mut identity = None;
        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| {
                let user = request
                    .headers()
                    .get(USER_HEADER)
                    .and_then(|value| value.to_str().ok());
                match parse_identity(request.uri().path(), user) {
                    Ok(found) => {
                        identity = Some(found);
                        Ok(response)
                    }
                    Err(e) => {
                        log::warn!("Rejected upgrade from {addr}: {e}");
                        Err(reject(&e))
                    }
                }
            },
            Some(shared.connection.websocket_config()),
        )
        .await;

        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let Some((room_id, user_id)) = identity else {
            return Ok(());
        };

        let hub = shared.rooms.join(room_id).await;
        let conn = ClientConnection::spawn(
            ws,
            user_id,
            hub,
            shared.router.clone(),
            shared.connection.clone(),
        );
        shared.counters.total.fetch_add(1, Ordering::Relaxed);
        shared.counters.active.fetch_add(1, Ordering::Relaxed);
        log::info!("User {user_id} joined room {room_id} from {addr}");

        conn.closed().await;

        shared.rooms.leave(room_id).await;
        shared.counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("User {user_id} left room {room_id}");
        Ok(())
    }
}

//! # tabletop-sync — Real-time character sheet synchronization
//!
//! Rooms of players edit shared character sheets over WebSocket. Every edit
//! is a path-addressed mutation, checked against the editor's permissions,
//! applied atomically and stamped with the sheet's next version, then
//! relayed to the rest of the room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  frames   ┌───────────────┐  Mutation  ┌────────────────┐
//! │ ClientConnection │ ────────► │ MessageRouter │ ─────────► │ MutationService│
//! │ reader │ writer  │           └───────┬───────┘            └───────┬────────┘
//! └────────┴────▲────┘                   │ ACK / NACK / relay          │ commit
//!               │                        ▼                             ▼
//!               │  client queue   ┌─────────────┐              ┌───────────────┐
//!               └──────────────── │ Hub (room)  │              │ DocumentStore │
//!                                 └─────────────┘              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`path`] — dotted document paths and the item/layout pair
//! - [`document`] — sheet records, default content and mutations
//! - [`validator`] — expected value kinds per path pattern
//! - [`permission`] — who may edit a sheet
//! - [`storage`] — in-memory and RocksDB sheet stores
//! - [`service`] — the mutation operations
//! - [`hub`] — per-room fan-out actor and room registry
//! - [`protocol`] — JSON envelopes and responses
//! - [`router`] — dispatch of inbound frames
//! - [`connection`] — WebSocket reader and writer tasks
//! - [`server`] — accept loop and upgrade handling

pub mod connection;
pub mod document;
pub mod hub;
pub mod path;
pub mod permission;
pub mod protocol;
pub mod router;
pub mod server;
pub mod service;
pub mod storage;
pub mod validator;

pub type SheetId = u64;
pub type UserId = u64;
pub type RoomId = u64;

// Re-exports for convenience
pub use connection::{ClientConnection, ConnectionConfig};
pub use document::{default_content, validate_content, Mutation, MutationError, Position, SheetRecord};
pub use hub::{ClientHandle, ClientId, Frame, Hub, HubConfig, HubHandle, HubStats, RoomRegistry};
pub use path::{DocPath, ItemSlot, PathError};
pub use permission::{can_edit, RoomRole, Visibility};
pub use protocol::{ErrorCode, MessageKind, ProtocolError, Response};
pub use router::{ClientContext, MessageRouter};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{MutationService, ServiceError};
pub use storage::{DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError};
pub use validator::{PathValidator, ValidationError, ValueKind};

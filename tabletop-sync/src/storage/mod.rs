//! Persistent storage for character sheets.
//!
//! ```text
//! MutationService ── commit(sheet, user, &Mutation)
//!        │
//!        ▼
//! DocumentStore ──┬── MemoryDocumentStore (tests, no storage path)
//!                 └── RocksDocumentStore
//!                         ├── sheets  (bincode record, LZ4 JSON content)
//!                         └── members (room:user → role)
//! ```
//!
//! `commit` is the only way content changes after creation. It loads the
//! sheet, evaluates the edit permission, applies the mutation and writes the
//! result with `version + 1` while holding the store's commit lock, so
//! concurrent commits are serialized and a rejected one writes nothing.
//! `change_visibility` and `delete` take the same lock.

pub mod memory;
pub mod rocks;

pub use memory::MemoryDocumentStore;
pub use rocks::{RocksDocumentStore, StoreConfig};

use serde_json::Value;
use thiserror::Error;

use crate::document::{default_content, unix_now, ContentError, Mutation, MutationError, SheetRecord};
use crate::permission::{can_edit, RoomRole, Visibility};
use crate::{RoomId, SheetId, UserId};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Sheet not found: {0}")]
    NotFound(SheetId),
    #[error("user {user_id} may not edit sheet {sheet_id}")]
    PermissionDenied { sheet_id: SheetId, user_id: UserId },
    #[error("only the owner may share sheet {sheet_id}, not user {user_id}")]
    NotOwner { sheet_id: SheetId, user_id: UserId },
    #[error(transparent)]
    Rejected(#[from] MutationError),
    #[error("invalid sheet content: {0}")]
    InvalidContent(#[from] ContentError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Sheet storage shared by every room.
pub trait DocumentStore: Send + Sync {
    /// Create a sheet with the default content.
    fn create(
        &self,
        owner_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
    ) -> Result<SheetRecord, StoreError> {
        self.create_with_content(owner_id, room_id, visibility, default_content())
    }

    /// Create a sheet from imported content.
    fn create_with_content(
        &self,
        owner_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
        content: Value,
    ) -> Result<SheetRecord, StoreError>;

    fn load(&self, sheet_id: SheetId) -> Result<SheetRecord, StoreError>;

    fn list(&self) -> Result<Vec<SheetId>, StoreError>;

    /// Set or clear (`None`) a user's role in a room.
    fn set_member_role(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Option<RoomRole>,
    ) -> Result<(), StoreError>;

    fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<RoomRole>, StoreError>;

    /// Check permission, apply `mutation` and persist the result as one
    /// atomic step. Returns the new version.
    fn commit(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        mutation: &Mutation,
    ) -> Result<u64, StoreError>;

    /// Change who may see or edit a sheet. Owner only; bumps the version.
    fn change_visibility(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        visibility: Visibility,
    ) -> Result<u64, StoreError>;

    /// Remove a sheet, if `user_id` may edit it.
    fn delete(&self, sheet_id: SheetId, user_id: UserId) -> Result<(), StoreError>;
}

/// Refuse unless `user_id` passes the edit predicate for `sheet`.
pub(crate) fn ensure_can_edit(
    sheet: &SheetRecord,
    user_id: UserId,
    role: Option<RoomRole>,
) -> Result<(), StoreError> {
    if can_edit(user_id, sheet, role) {
        Ok(())
    } else {
        Err(StoreError::PermissionDenied {
            sheet_id: sheet.id,
            user_id,
        })
    }
}

/// The record after `mutation`, or the reason it is refused. Callers hold
/// their commit lock around load, this call and the write.
pub(crate) fn prepare_commit(
    mut current: SheetRecord,
    user_id: UserId,
    role: Option<RoomRole>,
    mutation: &Mutation,
) -> Result<SheetRecord, StoreError> {
    ensure_can_edit(&current, user_id, role)?;
    current.content = mutation.apply(&current.content)?;
    current.version += 1;
    current.updated_at = unix_now();
    Ok(current)
}

/// The record with its visibility changed, or the reason it is refused.
pub(crate) fn prepare_visibility(
    mut current: SheetRecord,
    user_id: UserId,
    visibility: Visibility,
) -> Result<SheetRecord, StoreError> {
    if current.owner_id != user_id {
        return Err(StoreError::NotOwner {
            sheet_id: current.id,
            user_id,
        });
    }
    current.visibility = visibility;
    current.version += 1;
    current.updated_at = unix_now();
    Ok(current)
}

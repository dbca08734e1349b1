//! Sheet mutation service.
//!
//! Each operation validates its input, builds one [`Mutation`] and hands it
//! to the store's atomic `commit`. The returned version is what the router
//! sends back in the ACK. Sheet creation, deletion, sharing and room roles
//! go to the store's dedicated calls instead.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::document::{Mutation, MutationError, Position, SheetRecord};
use crate::path::{DocPath, ItemSlot, PathError};
use crate::permission::{RoomRole, Visibility};
use crate::protocol::{ErrorCode, ProtocolError};
use crate::storage::{DocumentStore, StoreError};
use crate::validator::{PathValidator, ValidationError};
use crate::{RoomId, SheetId, UserId};

/// Why a request was refused.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Code reported in the NACK.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation(_) => ErrorCode::Validation,
            ServiceError::PermissionDenied(_) => ErrorCode::Conflict,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<PathError> for ServiceError {
    fn from(e: PathError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

impl From<ValidationError> for ServiceError {
    fn from(e: ValidationError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

impl From<ProtocolError> for ServiceError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Encode(_) => ServiceError::Internal(e.to_string()),
            _ => ServiceError::Validation(e.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(format!("sheet {id}")),
            StoreError::PermissionDenied { .. } | StoreError::NotOwner { .. } => {
                ServiceError::PermissionDenied(e.to_string())
            }
            StoreError::Rejected(MutationError::ItemNotFound(path)) => ServiceError::NotFound(path),
            StoreError::Rejected(MutationError::Path(e)) => e.into(),
            StoreError::InvalidContent(e) => ServiceError::Validation(e.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// Applies path-scoped edits to stored sheets.
pub struct MutationService {
    store: Arc<dyn DocumentStore>,
    validator: PathValidator,
}

impl MutationService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_validator(store, PathValidator::default())
    }

    pub fn with_validator(store: Arc<dyn DocumentStore>, validator: PathValidator) -> Self {
        Self { store, validator }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Place a new item in `grid`. `init` defaults to `{}`.
    pub fn create_item(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        grid: &DocPath,
        item_id: &str,
        init: Option<Value>,
        position: Position,
    ) -> Result<u64, ServiceError> {
        let slot = ItemSlot::new(grid, item_id)?;
        self.commit(
            sheet_id,
            user_id,
            Mutation::CreateItem {
                slot,
                init,
                position,
            },
        )
    }

    /// Set a single field after checking its type hint.
    pub fn change_field(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        path: &DocPath,
        value: Value,
    ) -> Result<u64, ServiceError> {
        self.validator.validate_field(path, &value)?;
        self.commit(
            sheet_id,
            user_id,
            Mutation::ChangeField {
                path: path.clone(),
                value,
            },
        )
    }

    /// Shallow-merge `changes` into the object at `base`; one version bump.
    pub fn apply_batch(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        base: &DocPath,
        changes: &Value,
    ) -> Result<u64, ServiceError> {
        let changes = self.validator.validate_batch(base, changes)?;
        self.commit(
            sheet_id,
            user_id,
            Mutation::ApplyBatch {
                base: base.clone(),
                changes,
            },
        )
    }

    pub fn replace_positions(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        grid: &DocPath,
        positions: BTreeMap<String, Position>,
    ) -> Result<u64, ServiceError> {
        self.commit(
            sheet_id,
            user_id,
            Mutation::ReplacePositions {
                grid: grid.clone(),
                positions,
            },
        )
    }

    /// Move an item and its layout from one grid to another as one commit.
    pub fn move_item(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        from_grid: &DocPath,
        to_grid: &DocPath,
        item_id: &str,
        position: Position,
    ) -> Result<u64, ServiceError> {
        let from = ItemSlot::new(from_grid, item_id)?;
        let to = ItemSlot::new(to_grid, item_id)?;
        self.commit(sheet_id, user_id, Mutation::MoveItem { from, to, position })
    }

    pub fn delete_item(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        grid: &DocPath,
        item_id: &str,
    ) -> Result<u64, ServiceError> {
        let slot = ItemSlot::new(grid, item_id)?;
        self.commit(sheet_id, user_id, Mutation::DeleteItem { slot })
    }

    // ─── Sheets and roles ─────────────────────────────────────────────

    /// Create a default sheet owned by `user_id` in `room_id`.
    pub fn create_sheet(
        &self,
        user_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
    ) -> Result<SheetRecord, ServiceError> {
        let sheet = self.store.create(user_id, room_id, visibility)?;
        log::info!("sheet {}: created by user {user_id} in room {room_id}", sheet.id);
        Ok(sheet)
    }

    /// Delete a sheet the user may edit.
    pub fn delete_sheet(&self, user_id: UserId, sheet_id: SheetId) -> Result<(), ServiceError> {
        self.store.delete(sheet_id, user_id)?;
        log::info!("sheet {sheet_id}: deleted by user {user_id}");
        Ok(())
    }

    /// Share or hide a sheet. Only its owner may.
    pub fn change_visibility(
        &self,
        user_id: UserId,
        sheet_id: SheetId,
        visibility: Visibility,
    ) -> Result<u64, ServiceError> {
        let version = self.store.change_visibility(sheet_id, user_id, visibility)?;
        log::info!("sheet {sheet_id}: visibility {visibility:?} by user {user_id} as v{version}");
        Ok(version)
    }

    /// Give a member of `room_id` a new role. Only the room's game master
    /// may, and not for themselves.
    pub fn change_role(
        &self,
        requester: UserId,
        room_id: RoomId,
        target: UserId,
        role: RoomRole,
    ) -> Result<(), ServiceError> {
        if self.store.member_role(room_id, requester)? != Some(RoomRole::Gamemaster) {
            return Err(ServiceError::PermissionDenied(format!(
                "user {requester} is not the game master of room {room_id}"
            )));
        }
        if target == requester {
            return Err(ServiceError::Validation("cannot change your own role".into()));
        }
        if self.store.member_role(room_id, target)?.is_none() {
            return Err(ServiceError::Validation(format!(
                "user {target} is not a member of room {room_id}"
            )));
        }
        self.store.set_member_role(room_id, target, Some(role))?;
        log::info!("room {room_id}: user {target} is now {role:?}, set by user {requester}");
        Ok(())
    }

    fn commit(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        mutation: Mutation,
    ) -> Result<u64, ServiceError> {
        let version = self.store.commit(sheet_id, user_id, &mutation)?;
        log::info!(
            "sheet {sheet_id}: {} by user {user_id} committed as v{version}",
            mutation.kind()
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;
    use serde_json::json;

    const OWNER: UserId = 1;
    const ROOM: u64 = 50;

    fn path(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    fn setup() -> (MutationService, SheetId) {
        let store = Arc::new(MemoryDocumentStore::new());
        let sheet = store.create(OWNER, ROOM, Visibility::HideFromPlayers).unwrap();
        (MutationService::new(store), sheet.id)
    }

    fn content(service: &MutationService, sheet_id: SheetId) -> Value {
        service.store().load(sheet_id).unwrap().content
    }

    #[test]
    fn test_create_item_on_fresh_sheet() {
        let (service, sheet) = setup();
        let version = service
            .create_item(OWNER, sheet, &path("gear"), "sword1", Some(json!({})), Position::new(0, 0))
            .unwrap();
        assert_eq!(version, 1);

        let doc = content(&service, sheet);
        assert_eq!(doc["gear"]["items"]["sword1"], json!({}));
        assert_eq!(
            doc["gear"]["layouts"]["sword1"],
            json!({"colIndex": 0, "rowIndex": 0})
        );
    }

    #[test]
    fn test_unhinted_change_stored_verbatim() {
        let (service, sheet) = setup();
        service
            .change_field(OWNER, sheet, &path("characteristics.WS.value"), json!("45"))
            .unwrap();
        assert_eq!(
            content(&service, sheet)["characteristics"]["WS"]["value"],
            json!("45")
        );
    }

    #[test]
    fn test_bad_type_rejected_before_commit() {
        let (service, sheet) = setup();
        let err = service
            .change_field(OWNER, sheet, &path("armour.wounds_cur"), json!("lots"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(service.store().load(sheet).unwrap().version, 0);
    }

    #[test]
    fn test_batch_is_one_version() {
        let (service, sheet) = setup();
        service
            .change_field(OWNER, sheet, &path("movement.notes"), json!("slow"))
            .unwrap();
        let version = service
            .apply_batch(
                OWNER,
                sheet,
                &path("movement"),
                &json!({"move_half": 3, "move_full": 6, "charge": 9}),
            )
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(
            content(&service, sheet)["movement"],
            json!({"move_half": 3, "move_full": 6, "charge": 9, "notes": "slow"})
        );
    }

    #[test]
    fn test_batch_failures_reported_together() {
        let (service, sheet) = setup();
        let err = service
            .apply_batch(
                OWNER,
                sheet,
                &path("armour"),
                &json!({"wounds_max": "x", "wounds_cur": "y"}),
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("armour.wounds_max"));
        assert!(message.contains("armour.wounds_cur"));
    }

    #[test]
    fn test_move_item_is_one_version() {
        let (service, sheet) = setup();
        service
            .create_item(OWNER, sheet, &path("gear"), "rope", Some(json!({"len": 10})), Position::new(0, 0))
            .unwrap();
        let version = service
            .move_item(OWNER, sheet, &path("gear"), &path("cybernetics"), "rope", Position::new(2, 3))
            .unwrap();
        assert_eq!(version, 2);

        let doc = content(&service, sheet);
        assert!(doc["gear"]["items"].get("rope").is_none());
        assert!(doc["gear"]["layouts"].get("rope").is_none());
        assert_eq!(doc["cybernetics"]["items"]["rope"], json!({"len": 10}));
        assert_eq!(
            doc["cybernetics"]["layouts"]["rope"],
            json!({"colIndex": 2, "rowIndex": 3})
        );
    }

    #[test]
    fn test_move_missing_item_not_found() {
        let (service, sheet) = setup();
        let before = service.store().load(sheet).unwrap();
        let err = service
            .move_item(OWNER, sheet, &path("gear"), &path("cybernetics"), "ghost", Position::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(service.store().load(sheet).unwrap(), before);
    }

    #[test]
    fn test_delete_item_removes_pair() {
        let (service, sheet) = setup();
        service
            .create_item(OWNER, sheet, &path("traits"), "t1", None, Position::new(0, 1))
            .unwrap();
        let version = service
            .delete_item(OWNER, sheet, &path("traits"), "t1")
            .unwrap();
        assert_eq!(version, 2);
        let doc = content(&service, sheet);
        assert_eq!(doc["traits"], json!({"items": {}, "layouts": {}}));
    }

    #[test]
    fn test_replace_positions() {
        let (service, sheet) = setup();
        service
            .create_item(OWNER, sheet, &path("gear"), "a", None, Position::new(0, 0))
            .unwrap();
        let mut positions = BTreeMap::new();
        positions.insert("a".to_owned(), Position::new(4, 1));
        service
            .replace_positions(OWNER, sheet, &path("gear"), positions)
            .unwrap();
        assert_eq!(
            content(&service, sheet)["gear"]["layouts"]["a"],
            json!({"colIndex": 4, "rowIndex": 1})
        );
    }

    #[test]
    fn test_permission_denied_maps_to_conflict() {
        let (service, sheet) = setup();
        service
            .store()
            .set_member_role(ROOM, 2, Some(RoomRole::Player))
            .unwrap();
        let err = service
            .change_field(2, sheet, &path("size"), json!(1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::PermissionDenied(_)));
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[test]
    fn test_unknown_sheet_not_found() {
        let (service, _) = setup();
        let err = service
            .change_field(OWNER, 999, &path("size"), json!(1))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_invalid_item_id() {
        let (service, sheet) = setup();
        let err = service
            .create_item(OWNER, sheet, &path("gear"), "", None, Position::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn test_padded_item_id_rejected() {
        let (service, sheet) = setup();
        let err = service
            .create_item(OWNER, sheet, &path("gear"), " sword1 ", None, Position::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(content(&service, sheet)["gear"].get("items").is_none());
    }

    #[test]
    fn test_change_cannot_create_orphan_item() {
        let (service, sheet) = setup();
        let err = service
            .change_field(OWNER, sheet, &path("gear.items.ghost"), json!({"name": "Ghost"}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(service.store().load(sheet).unwrap().version, 0);
        assert!(content(&service, sheet)["gear"].get("items").is_none());
    }

    #[test]
    fn test_batch_cannot_wipe_layouts() {
        let (service, sheet) = setup();
        service
            .create_item(OWNER, sheet, &path("gear"), "sword1", None, Position::new(1, 1))
            .unwrap();
        let err = service
            .apply_batch(OWNER, sheet, &path("gear"), &json!({"layouts": {}}))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let stored = service.store().load(sheet).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(
            stored.content["gear"]["layouts"]["sword1"],
            json!({"colIndex": 1, "rowIndex": 1})
        );
    }

    #[test]
    fn test_edit_inside_existing_item() {
        let (service, sheet) = setup();
        service
            .create_item(OWNER, sheet, &path("gear"), "sword1", None, Position::new(0, 0))
            .unwrap();
        service
            .change_field(OWNER, sheet, &path("gear.items.sword1.name"), json!("Chainsword"))
            .unwrap();
        let version = service
            .apply_batch(
                OWNER,
                sheet,
                &path("gear.items.sword1"),
                &json!({"cost": 25, "notes": "loud"}),
            )
            .unwrap();
        assert_eq!(version, 3);
        assert_eq!(
            content(&service, sheet)["gear"]["items"]["sword1"],
            json!({"name": "Chainsword", "cost": 25, "notes": "loud"})
        );
    }

    #[test]
    fn test_create_and_delete_sheet() {
        let (service, _) = setup();
        let sheet = service
            .create_sheet(7, ROOM, Visibility::EveryoneCanSee)
            .unwrap();
        assert_eq!(sheet.owner_id, 7);
        assert_eq!(sheet.room_id, ROOM);
        assert_eq!(sheet.version, 0);

        let err = service.delete_sheet(OWNER, sheet.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        service.delete_sheet(7, sheet.id).unwrap();
        let err = service.delete_sheet(7, sheet.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_change_visibility_owner_only() {
        let (service, sheet) = setup();
        service
            .store()
            .set_member_role(ROOM, 2, Some(RoomRole::Gamemaster))
            .unwrap();

        let err = service
            .change_visibility(2, sheet, Visibility::EveryoneCanEdit)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let version = service
            .change_visibility(OWNER, sheet, Visibility::EveryoneCanEdit)
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            service.store().load(sheet).unwrap().visibility,
            Visibility::EveryoneCanEdit
        );
    }

    #[test]
    fn test_shared_sheet_becomes_editable() {
        let (service, sheet) = setup();
        service
            .store()
            .set_member_role(ROOM, 2, Some(RoomRole::Player))
            .unwrap();
        assert!(service.change_field(2, sheet, &path("size"), json!(1)).is_err());

        service
            .change_visibility(OWNER, sheet, Visibility::EveryoneCanEdit)
            .unwrap();
        assert_eq!(service.change_field(2, sheet, &path("size"), json!(1)).unwrap(), 2);
    }

    #[test]
    fn test_change_role() {
        let (service, _) = setup();
        let store = service.store();
        store.set_member_role(ROOM, 10, Some(RoomRole::Gamemaster)).unwrap();
        store.set_member_role(ROOM, 11, Some(RoomRole::Player)).unwrap();

        let err = service
            .change_role(11, ROOM, 11, RoomRole::Gamemaster)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = service.change_role(10, ROOM, 12, RoomRole::Player).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let err = service
            .change_role(10, ROOM, 10, RoomRole::Player)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        service.change_role(10, ROOM, 11, RoomRole::Gamemaster).unwrap();
        assert_eq!(store.member_role(ROOM, 11).unwrap(), Some(RoomRole::Gamemaster));
    }
}

//! In-process sheet store.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{ensure_can_edit, prepare_commit, prepare_visibility, DocumentStore, StoreError};
use crate::document::{validate_content, Mutation, SheetRecord};
use crate::permission::{RoomRole, Visibility};
use crate::{RoomId, SheetId, UserId};

#[derive(Default)]
struct MemoryState {
    sheets: HashMap<SheetId, SheetRecord>,
    members: HashMap<(RoomId, UserId), RoomRole>,
    last_id: SheetId,
}

/// Keeps every sheet in a map behind one mutex, which doubles as the
/// commit lock.
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn create_with_content(
        &self,
        owner_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
        content: Value,
    ) -> Result<SheetRecord, StoreError> {
        validate_content(&content)?;
        let mut state = self.state()?;
        state.last_id += 1;
        let record = SheetRecord::new(state.last_id, owner_id, room_id, visibility, content);
        state.sheets.insert(record.id, record.clone());
        Ok(record)
    }

    fn load(&self, sheet_id: SheetId) -> Result<SheetRecord, StoreError> {
        self.state()?
            .sheets
            .get(&sheet_id)
            .cloned()
            .ok_or(StoreError::NotFound(sheet_id))
    }

    fn list(&self) -> Result<Vec<SheetId>, StoreError> {
        let mut ids: Vec<SheetId> = self.state()?.sheets.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn set_member_role(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Option<RoomRole>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        match role {
            Some(role) => state.members.insert((room_id, user_id), role),
            None => state.members.remove(&(room_id, user_id)),
        };
        Ok(())
    }

    fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<RoomRole>, StoreError> {
        Ok(self.state()?.members.get(&(room_id, user_id)).copied())
    }

    fn commit(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        mutation: &Mutation,
    ) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let current = state
            .sheets
            .get(&sheet_id)
            .cloned()
            .ok_or(StoreError::NotFound(sheet_id))?;
        let role = state.members.get(&(current.room_id, user_id)).copied();
        let next = prepare_commit(current, user_id, role, mutation)?;
        let version = next.version;
        state.sheets.insert(sheet_id, next);
        Ok(version)
    }

    fn change_visibility(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        visibility: Visibility,
    ) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let current = state
            .sheets
            .get(&sheet_id)
            .cloned()
            .ok_or(StoreError::NotFound(sheet_id))?;
        let next = prepare_visibility(current, user_id, visibility)?;
        let version = next.version;
        state.sheets.insert(sheet_id, next);
        Ok(version)
    }

    fn delete(&self, sheet_id: SheetId, user_id: UserId) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let current = state
            .sheets
            .get(&sheet_id)
            .ok_or(StoreError::NotFound(sheet_id))?;
        let role = state.members.get(&(current.room_id, user_id)).copied();
        ensure_can_edit(current, user_id, role)?;
        state.sheets.remove(&sheet_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Position;
    use crate::path::{DocPath, ItemSlot};
    use serde_json::json;
    use std::sync::Arc;

    fn change(path: &str, value: Value) -> Mutation {
        Mutation::ChangeField {
            path: DocPath::parse(path).unwrap(),
            value,
        }
    }

    #[test]
    fn test_create_assigns_ids_and_version_zero() {
        let store = MemoryDocumentStore::new();
        let a = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        let b = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        assert_eq!(a.version, 0);
        assert_ne!(a.id, b.id);
        assert_eq!(store.list().unwrap(), vec![a.id, b.id]);
    }

    #[test]
    fn test_create_with_invalid_content_rejected() {
        let store = MemoryDocumentStore::new();
        let result = store.create_with_content(1, 7, Visibility::HideFromPlayers, json!({}));
        assert!(matches!(result, Err(StoreError::InvalidContent(_))));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_commit_bumps_version() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        assert_eq!(store.commit(sheet.id, 1, &change("size", json!(1))).unwrap(), 1);
        assert_eq!(store.commit(sheet.id, 1, &change("size", json!(2))).unwrap(), 2);
        let loaded = store.load(sheet.id).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.content["size"], json!(2));
    }

    #[test]
    fn test_commit_denied_writes_nothing() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::EveryoneCanView).unwrap();
        store.set_member_role(7, 2, Some(RoomRole::Player)).unwrap();
        let result = store.commit(sheet.id, 2, &change("size", json!(3)));
        assert!(matches!(result, Err(StoreError::PermissionDenied { .. })));
        assert_eq!(store.load(sheet.id).unwrap(), sheet);
    }

    #[test]
    fn test_gamemaster_may_commit() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        store.set_member_role(7, 9, Some(RoomRole::Gamemaster)).unwrap();
        assert_eq!(store.commit(sheet.id, 9, &change("size", json!(3))).unwrap(), 1);

        store.set_member_role(7, 9, None).unwrap();
        assert_eq!(store.member_role(7, 9).unwrap(), None);
        assert!(store.commit(sheet.id, 9, &change("size", json!(4))).is_err());
    }

    #[test]
    fn test_commit_unknown_sheet() {
        let store = MemoryDocumentStore::new();
        assert!(matches!(
            store.commit(99, 1, &change("size", json!(1))),
            Err(StoreError::NotFound(99))
        ));
    }

    #[test]
    fn test_failed_move_leaves_sheet_unchanged() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        let gear = DocPath::parse("gear").unwrap();
        let create = Mutation::CreateItem {
            slot: ItemSlot::new(&gear, "rope").unwrap(),
            init: Some(json!({"name": "Rope"})),
            position: Position::new(0, 0),
        };
        store.commit(sheet.id, 1, &create).unwrap();
        let before = store.load(sheet.id).unwrap();

        let mv = Mutation::MoveItem {
            from: ItemSlot::new(&gear, "rope").unwrap(),
            to: ItemSlot::new(&DocPath::parse("initiative").unwrap(), "rope").unwrap(),
            position: Position::new(1, 1),
        };
        assert!(matches!(
            store.commit(sheet.id, 1, &mv),
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.load(sheet.id).unwrap(), before);
    }

    #[test]
    fn test_concurrent_commits_get_consecutive_versions() {
        let store = Arc::new(MemoryDocumentStore::new());
        let sheet = store.create(1, 7, Visibility::EveryoneCanEdit).unwrap();
        store.set_member_role(7, 2, Some(RoomRole::Player)).unwrap();

        let handles: Vec<_> = [(1u64, "from-owner"), (2u64, "from-player")]
            .into_iter()
            .map(|(user, value)| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let version = store
                        .commit(sheet.id, user, &change("notes.text", json!(value)))
                        .unwrap();
                    (version, value)
                })
            })
            .collect();
        let mut results: Vec<(u64, &str)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort();

        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 2);
        let stored = store.load(sheet.id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.content["notes"]["text"], json!(results[1].1));
    }

    #[test]
    fn test_change_visibility_is_owner_only() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::HideFromPlayers).unwrap();
        store.set_member_role(7, 2, Some(RoomRole::Gamemaster)).unwrap();

        assert!(matches!(
            store.change_visibility(sheet.id, 2, Visibility::EveryoneCanEdit),
            Err(StoreError::NotOwner { .. })
        ));
        assert_eq!(
            store
                .change_visibility(sheet.id, 1, Visibility::EveryoneCanEdit)
                .unwrap(),
            1
        );
        let loaded = store.load(sheet.id).unwrap();
        assert_eq!(loaded.visibility, Visibility::EveryoneCanEdit);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_delete_uses_edit_permission() {
        let store = MemoryDocumentStore::new();
        let sheet = store.create(1, 7, Visibility::EveryoneCanView).unwrap();
        store.set_member_role(7, 2, Some(RoomRole::Player)).unwrap();
        store.set_member_role(7, 3, Some(RoomRole::Gamemaster)).unwrap();

        assert!(matches!(
            store.delete(sheet.id, 2),
            Err(StoreError::PermissionDenied { .. })
        ));
        store.delete(sheet.id, 3).unwrap();
        assert!(matches!(store.load(sheet.id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(sheet.id, 1), Err(StoreError::NotFound(_))));
        assert!(store.list().unwrap().is_empty());
    }
}

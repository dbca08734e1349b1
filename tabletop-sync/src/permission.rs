//! Edit permission for character sheets.
//!
//! A user may edit a sheet when they own it, when they are the game master
//! of the sheet's room, or when they are a player in that room and the
//! sheet is shared with `everyone_can_edit`.

use serde::{Deserialize, Serialize};

use crate::document::SheetRecord;
use crate::UserId;

/// A user's role inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Gamemaster,
    Player,
}

/// Who besides the owner may see or change a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    EveryoneCanEdit,
    EveryoneCanView,
    EveryoneCanSee,
    #[default]
    HideFromPlayers,
}

/// Evaluate the edit predicate. `role` is the user's role in the sheet's
/// room, `None` when they are not a member.
pub fn can_edit(user_id: UserId, sheet: &SheetRecord, role: Option<RoomRole>) -> bool {
    if sheet.owner_id == user_id {
        return true;
    }
    match role {
        Some(RoomRole::Gamemaster) => true,
        Some(RoomRole::Player) => sheet.visibility == Visibility::EveryoneCanEdit,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::default_content;

    fn sheet(visibility: Visibility) -> SheetRecord {
        SheetRecord::new(1, 10, 100, visibility, default_content())
    }

    #[test]
    fn test_owner_always_edits() {
        let sheet = sheet(Visibility::HideFromPlayers);
        assert!(can_edit(10, &sheet, None));
    }

    #[test]
    fn test_gamemaster_edits_hidden_sheet() {
        let sheet = sheet(Visibility::HideFromPlayers);
        assert!(can_edit(20, &sheet, Some(RoomRole::Gamemaster)));
    }

    #[test]
    fn test_player_needs_shared_edit() {
        assert!(can_edit(
            30,
            &sheet(Visibility::EveryoneCanEdit),
            Some(RoomRole::Player)
        ));
        assert!(!can_edit(
            30,
            &sheet(Visibility::EveryoneCanView),
            Some(RoomRole::Player)
        ));
    }

    #[test]
    fn test_outsider_denied() {
        assert!(!can_edit(40, &sheet(Visibility::EveryoneCanEdit), None));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&Visibility::EveryoneCanEdit).unwrap(),
            "\"everyone_can_edit\""
        );
        assert_eq!(
            serde_json::to_string(&RoomRole::Gamemaster).unwrap(),
            "\"gamemaster\""
        );
    }
}

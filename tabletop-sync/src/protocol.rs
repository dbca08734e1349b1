//! JSON wire protocol.
//!
//! Every inbound frame is an envelope `{"type": ..., ...}`. The reader only
//! peeks at `type`; the router decodes the full payload once it knows which
//! request it is. Replies to the requester use one shape:
//!
//! ```json
//! {"type":"response","eventID":"e1","OK":true,"version":4}
//! {"type":"response","eventID":"e2","OK":false,"code":"validation","message":"Bad Request"}
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::document::{Position, SheetRecord};
use crate::permission::{RoomRole, Visibility};
use crate::{SheetId, UserId};

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Every request type the router handles. Anything else is relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CreateItem,
    Change,
    Batch,
    PositionsChanged,
    MoveItemBetweenGrids,
    DeleteItem,
    ChatMessage,
    NewCharacter,
    DeleteCharacter,
    ChangeSheetVisibility,
    ChangePlayerRole,
}

/// Who receives the original envelope after a request succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Everyone in the room except the requester.
    Others,
    /// Everyone in the room.
    Everyone,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::CreateItem,
        MessageKind::Change,
        MessageKind::Batch,
        MessageKind::PositionsChanged,
        MessageKind::MoveItemBetweenGrids,
        MessageKind::DeleteItem,
        MessageKind::ChatMessage,
        MessageKind::NewCharacter,
        MessageKind::DeleteCharacter,
        MessageKind::ChangeSheetVisibility,
        MessageKind::ChangePlayerRole,
    ];

    pub fn from_discriminant(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::CreateItem => "createItem",
            MessageKind::Change => "change",
            MessageKind::Batch => "batch",
            MessageKind::PositionsChanged => "positionsChanged",
            MessageKind::MoveItemBetweenGrids => "moveItemBetweenGrids",
            MessageKind::DeleteItem => "deleteItem",
            MessageKind::ChatMessage => "chatMessage",
            MessageKind::NewCharacter => "newCharacter",
            MessageKind::DeleteCharacter => "deleteCharacter",
            MessageKind::ChangeSheetVisibility => "changeSheetVisibility",
            MessageKind::ChangePlayerRole => "changePlayerRole",
        }
    }

    /// Sheet edits go to the other clients, who already hold the sheet;
    /// sheet lifecycle changes go to everyone so every sheet list agrees.
    pub fn broadcast_scope(self) -> BroadcastScope {
        match self {
            MessageKind::CreateItem
            | MessageKind::Change
            | MessageKind::Batch
            | MessageKind::PositionsChanged
            | MessageKind::MoveItemBetweenGrids
            | MessageKind::DeleteItem
            | MessageKind::ChatMessage
            | MessageKind::ChangePlayerRole => BroadcastScope::Others,
            MessageKind::NewCharacter
            | MessageKind::DeleteCharacter
            | MessageKind::ChangeSheetVisibility => BroadcastScope::Everyone,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct EventHeader {
    #[serde(rename = "eventID", default)]
    event_id: Value,
}

/// Read the `type` discriminant without decoding the rest of the frame.
pub fn peek_kind(raw: &str) -> Result<String, ProtocolError> {
    serde_json::from_str::<Envelope>(raw)
        .map(|envelope| envelope.kind)
        .map_err(ProtocolError::MalformedEnvelope)
}

/// Best-effort `eventID`, empty when absent or unreadable.
pub fn peek_event_id(raw: &str) -> String {
    match serde_json::from_str::<EventHeader>(raw).map(|h| h.event_id) {
        Ok(Value::String(id)) => id,
        Ok(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Decode the full payload of a request of the given kind.
pub fn decode<'a, T: Deserialize<'a>>(kind: MessageKind, raw: &'a str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(|source| ProtocolError::Payload { kind, source })
}

/// Sheet ids arrive as numbers or numeric strings.
fn de_sheet_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SheetId, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(SheetId),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid sheetID {text:?}"))),
    }
}

// ─── Requests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateItemRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    /// Grid the item goes into.
    pub path: String,
    pub item_id: String,
    pub item_pos: Position,
    #[serde(default)]
    pub init: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    pub path: String,
    pub change: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    pub path: String,
    pub changes: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    /// Grid whose layouts are replaced.
    pub path: String,
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveItemRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    pub from_path: String,
    pub to_path: String,
    pub item_id: String,
    pub to_position: Position,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    /// Grid holding the item.
    pub path: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageRequest {
    pub body: String,
}

/// Create a sheet owned by the requester in the requester's room.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCharacterRequest {
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteCharacterRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeVisibilityRequest {
    #[serde(rename = "sheetID", alias = "sheetId", deserialize_with = "de_sheet_id")]
    pub sheet_id: SheetId,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRoleRequest {
    #[serde(rename = "userID", alias = "userId")]
    pub user_id: UserId,
    pub role: RoomRole,
}

// ─── Notices ──────────────────────────────────────────────────────────

/// Sent to the whole room when a sheet is created, in place of the
/// `newCharacter` request, so every client learns the new sheet id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetCreated {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "eventID")]
    pub event_id: String,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "sheetID")]
    pub sheet_id: SheetId,
    pub name: String,
    /// Creation timestamp (seconds since epoch)
    pub created: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated: u64,
}

impl SheetCreated {
    pub const KIND: &'static str = "newCharacterItem";

    pub fn new(event_id: impl Into<String>, sheet: &SheetRecord) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            event_id: event_id.into(),
            user_id: sheet.owner_id,
            sheet_id: sheet.id,
            name: sheet.character_name().to_owned(),
            created: sheet.created_at,
            updated: sheet.updated_at,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

// ─── Responses ────────────────────────────────────────────────────────

/// Failure category reported to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// Generic text sent when debug detail is off.
    pub fn status_text(self) -> &'static str {
        match self {
            ErrorCode::Validation => "Bad Request",
            ErrorCode::Conflict => "Forbidden",
            ErrorCode::NotFound => "Not Found",
            ErrorCode::Internal => "Internal Server Error",
        }
    }
}

/// ACK or NACK for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "eventID")]
    pub event_id: String,
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub const KIND: &'static str = "response";

    pub fn ack(event_id: impl Into<String>, version: Option<u64>) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            event_id: event_id.into(),
            ok: true,
            version,
            code: None,
            message: None,
        }
    }

    pub fn nack(event_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            event_id: event_id.into(),
            ok: false,
            version: None,
            code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

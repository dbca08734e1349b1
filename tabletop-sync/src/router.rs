//! Dispatch of inbound frames to the mutation service.
//!
//! Every handled request follows the same steps: decode the typed payload,
//! run one service operation, then on success relay the original frame to
//! the room and ACK the requester, or on failure NACK the requester only.
//! `newCharacter` relays a generated `newCharacterItem` notice instead of
//! the request, since only the server knows the new sheet id.
//! Frames with a `type` outside [`MessageKind`] are relayed verbatim to the
//! whole room without a response; frames without a readable `type` are
//! dropped.

use crate::hub::{ClientId, HubHandle};
use crate::path::DocPath;
use crate::protocol::{
    self, BatchRequest, BroadcastScope, ChangeRequest, ChangeRoleRequest, ChangeVisibilityRequest,
    ChatMessageRequest, CreateItemRequest, DeleteCharacterRequest, DeleteItemRequest, ErrorCode,
    MessageKind, MoveItemRequest, NewCharacterRequest, PositionsRequest, Response, SheetCreated,
};
use crate::service::{MutationService, ServiceError};
use crate::UserId;

/// The connection a frame came from.
#[derive(Clone)]
pub struct ClientContext {
    pub id: ClientId,
    pub user_id: UserId,
    pub hub: HubHandle,
}

/// What a successful handler reports.
#[derive(Default)]
struct Handled {
    /// Version for the ACK, when the request committed one.
    version: Option<u64>,
    /// Frame relayed in place of the request.
    notice: Option<String>,
}

impl Handled {
    fn versioned(version: u64) -> Self {
        Self {
            version: Some(version),
            notice: None,
        }
    }
}

pub struct MessageRouter {
    service: MutationService,
    /// Send full error text in NACKs instead of a generic status.
    debug: bool,
}

impl MessageRouter {
    pub fn new(service: MutationService, debug: bool) -> Self {
        Self { service, debug }
    }

    pub fn service(&self) -> &MutationService {
        &self.service
    }

    /// Handle one inbound text frame.
    pub fn route(&self, ctx: &ClientContext, raw: &str) {
        let kind = match protocol::peek_kind(raw) {
            Ok(kind) => kind,
            Err(e) => {
                log::info!("client {}: ignoring frame: {e}", ctx.id);
                return;
            }
        };
        match MessageKind::from_discriminant(&kind) {
            Some(kind) => self.dispatch(ctx, kind, raw),
            None => {
                log::debug!("client {}: relaying unhandled type '{kind}'", ctx.id);
                self.relay(ctx, BroadcastScope::Everyone, raw);
            }
        }
    }

    /// Run the handler for `kind` and report the outcome.
    pub fn dispatch(&self, ctx: &ClientContext, kind: MessageKind, raw: &str) {
        let event_id = protocol::peek_event_id(raw);
        let user_id = ctx.user_id;
        let outcome = match kind {
            MessageKind::CreateItem => self.create_item(user_id, raw).map(Handled::versioned),
            MessageKind::Change => self.change(user_id, raw).map(Handled::versioned),
            MessageKind::Batch => self.batch(user_id, raw).map(Handled::versioned),
            MessageKind::PositionsChanged => {
                self.positions_changed(user_id, raw).map(Handled::versioned)
            }
            MessageKind::MoveItemBetweenGrids => {
                self.move_item(user_id, raw).map(Handled::versioned)
            }
            MessageKind::DeleteItem => self.delete_item(user_id, raw).map(Handled::versioned),
            MessageKind::ChatMessage => self.chat_message(raw).map(|()| Handled::default()),
            MessageKind::NewCharacter => self.new_character(ctx, &event_id, raw),
            MessageKind::DeleteCharacter => {
                self.delete_character(user_id, raw).map(|()| Handled::default())
            }
            MessageKind::ChangeSheetVisibility => {
                self.change_visibility(user_id, raw).map(Handled::versioned)
            }
            MessageKind::ChangePlayerRole => {
                self.change_role(ctx, raw).map(|()| Handled::default())
            }
        };

        match outcome {
            Ok(handled) => {
                let frame = handled.notice.as_deref().unwrap_or(raw);
                self.relay(ctx, kind.broadcast_scope(), frame);
                self.respond(ctx, Response::ack(event_id, handled.version));
            }
            Err(err) => {
                let code = err.code();
                if code == ErrorCode::Internal {
                    log::error!("client {}: {kind} '{event_id}' failed: {err}", ctx.id);
                } else {
                    log::warn!("client {}: {kind} '{event_id}' rejected: {err}", ctx.id);
                }
                let message = if self.debug {
                    err.to_string()
                } else {
                    code.status_text().to_owned()
                };
                self.respond(ctx, Response::nack(event_id, code, message));
            }
        }
    }

    fn relay(&self, ctx: &ClientContext, scope: BroadcastScope, raw: &str) {
        match scope {
            BroadcastScope::Others => ctx.hub.broadcast_from(ctx.id, raw),
            BroadcastScope::Everyone => ctx.hub.broadcast_all(raw),
        };
    }

    fn respond(&self, ctx: &ClientContext, response: Response) {
        match response.encode() {
            Ok(frame) => {
                ctx.hub.reply_to(ctx.id, frame);
            }
            Err(e) => log::error!("client {}: {e}", ctx.id),
        }
    }

    // ─── Handlers ─────────────────────────────────────────────────────

    fn create_item(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: CreateItemRequest = protocol::decode(MessageKind::CreateItem, raw)?;
        let grid = DocPath::parse(&request.path)?;
        self.service.create_item(
            user_id,
            request.sheet_id,
            &grid,
            &request.item_id,
            request.init,
            request.item_pos,
        )
    }

    fn change(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: ChangeRequest = protocol::decode(MessageKind::Change, raw)?;
        let path = DocPath::parse(&request.path)?;
        self.service
            .change_field(user_id, request.sheet_id, &path, request.change)
    }

    fn batch(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: BatchRequest = protocol::decode(MessageKind::Batch, raw)?;
        let base = DocPath::parse(&request.path)?;
        self.service
            .apply_batch(user_id, request.sheet_id, &base, &request.changes)
    }

    fn positions_changed(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: PositionsRequest = protocol::decode(MessageKind::PositionsChanged, raw)?;
        let grid = DocPath::parse(&request.path)?;
        self.service
            .replace_positions(user_id, request.sheet_id, &grid, request.positions)
    }

    fn move_item(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: MoveItemRequest = protocol::decode(MessageKind::MoveItemBetweenGrids, raw)?;
        let from = DocPath::parse(&request.from_path)?;
        let to = DocPath::parse(&request.to_path)?;
        self.service.move_item(
            user_id,
            request.sheet_id,
            &from,
            &to,
            &request.item_id,
            request.to_position,
        )
    }

    fn delete_item(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: DeleteItemRequest = protocol::decode(MessageKind::DeleteItem, raw)?;
        let grid = DocPath::parse(&request.path)?;
        self.service
            .delete_item(user_id, request.sheet_id, &grid, &request.item_id)
    }

    fn chat_message(&self, raw: &str) -> Result<(), ServiceError> {
        let request: ChatMessageRequest = protocol::decode(MessageKind::ChatMessage, raw)?;
        if request.body.trim().is_empty() {
            return Err(ServiceError::Validation("empty chat message".into()));
        }
        Ok(())
    }

    fn new_character(
        &self,
        ctx: &ClientContext,
        event_id: &str,
        raw: &str,
    ) -> Result<Handled, ServiceError> {
        let request: NewCharacterRequest = protocol::decode(MessageKind::NewCharacter, raw)?;
        let sheet = self
            .service
            .create_sheet(ctx.user_id, ctx.hub.room_id(), request.visibility)?;
        let notice = SheetCreated::new(event_id, &sheet).encode()?;
        Ok(Handled {
            version: Some(sheet.version),
            notice: Some(notice),
        })
    }

    fn delete_character(&self, user_id: UserId, raw: &str) -> Result<(), ServiceError> {
        let request: DeleteCharacterRequest = protocol::decode(MessageKind::DeleteCharacter, raw)?;
        self.service.delete_sheet(user_id, request.sheet_id)
    }

    fn change_visibility(&self, user_id: UserId, raw: &str) -> Result<u64, ServiceError> {
        let request: ChangeVisibilityRequest =
            protocol::decode(MessageKind::ChangeSheetVisibility, raw)?;
        self.service
            .change_visibility(user_id, request.sheet_id, request.visibility)
    }

    fn change_role(&self, ctx: &ClientContext, raw: &str) -> Result<(), ServiceError> {
        let request: ChangeRoleRequest = protocol::decode(MessageKind::ChangePlayerRole, raw)?;
        self.service
            .change_role(ctx.user_id, ctx.hub.room_id(), request.user_id, request.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ClientHandle, Frame, Hub, HubConfig};
    use crate::permission::{RoomRole, Visibility};
    use crate::storage::{DocumentStore, MemoryDocumentStore};
    use crate::SheetId;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    struct Room {
        router: MessageRouter,
        store: Arc<MemoryDocumentStore>,
        sheet_id: SheetId,
        requester: ClientContext,
        requester_rx: mpsc::Receiver<Frame>,
        peer_rx: mpsc::Receiver<Frame>,
    }

    fn room(debug: bool) -> Room {
        let store = Arc::new(MemoryDocumentStore::new());
        let sheet = store.create(1, 10, Visibility::HideFromPlayers).unwrap();
        let hub = Hub::spawn(10, &HubConfig::default());

        let (requester, requester_rx) = ClientHandle::new(1, 16);
        let (peer, peer_rx) = ClientHandle::new(2, 16);
        let ctx = ClientContext {
            id: requester.id(),
            user_id: 1,
            hub: hub.clone(),
        };
        hub.register(requester);
        hub.register(peer);

        Room {
            router: MessageRouter::new(MutationService::new(store.clone()), debug),
            store,
            sheet_id: sheet.id,
            requester: ctx,
            requester_rx,
            peer_rx,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> String {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed");
        frame.to_string()
    }

    async fn next_response(rx: &mut mpsc::Receiver<Frame>) -> Response {
        serde_json::from_str(&next(rx).await).unwrap()
    }

    /// The requester's response and the frame relayed back to it, in
    /// whichever order the hub delivered them.
    async fn response_and_relay(rx: &mut mpsc::Receiver<Frame>) -> (Response, String) {
        let first = next(rx).await;
        let second = next(rx).await;
        let is_response = |frame: &str| {
            serde_json::from_str::<Value>(frame).is_ok_and(|v| v["type"] == Response::KIND)
        };
        let (response, relay) = if is_response(&first) {
            (first, second)
        } else {
            (second, first)
        };
        (serde_json::from_str(&response).unwrap(), relay)
    }

    #[tokio::test]
    async fn test_create_item_acks_and_relays() {
        let mut room = room(false);
        let raw = json!({
            "type": "createItem",
            "eventID": "e1",
            "sheetID": room.sheet_id,
            "path": "gear",
            "itemId": "sword1",
            "itemPos": {"colIndex": 0, "rowIndex": 0}
        })
        .to_string();

        room.router.route(&room.requester, &raw);

        assert_eq!(next(&mut room.peer_rx).await, raw);
        let ack = next_response(&mut room.requester_rx).await;
        assert_eq!(ack, Response::ack("e1", Some(1)));
    }

    #[tokio::test]
    async fn test_validation_nack_not_relayed() {
        let mut room = room(false);
        let raw = json!({
            "type": "change",
            "eventID": "e2",
            "sheetID": room.sheet_id,
            "path": "size",
            "change": "huge"
        })
        .to_string();

        room.router.route(&room.requester, &raw);

        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack, Response::nack("e2", ErrorCode::Validation, "Bad Request"));
        assert!(room.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_debug_mode_sends_detail() {
        let mut room = room(true);
        let raw = json!({
            "type": "change",
            "eventID": "e3",
            "sheetID": room.sheet_id,
            "path": "size",
            "change": "huge"
        })
        .to_string();

        room.router.route(&room.requester, &raw);

        let nack = next_response(&mut room.requester_rx).await;
        let message = nack.message.unwrap();
        assert!(message.contains("size (expected number, got string)"), "{message}");
    }

    #[tokio::test]
    async fn test_undecodable_payload_nacks_with_event_id() {
        let mut room = room(false);
        let raw = r#"{"type":"deleteItem","eventID":"e4","path":"gear"}"#;

        room.router.route(&room.requester, raw);

        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack.event_id, "e4");
        assert_eq!(nack.code, Some(ErrorCode::Validation));
    }

    #[tokio::test]
    async fn test_permission_denied_is_conflict() {
        let mut room = room(false);
        let raw = json!({
            "type": "change",
            "eventID": "e5",
            "sheetID": room.sheet_id,
            "path": "notes.text",
            "change": "hello"
        })
        .to_string();
        let stranger = ClientContext {
            user_id: 99,
            ..room.requester.clone()
        };

        room.router.route(&stranger, &raw);

        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack.code, Some(ErrorCode::Conflict));
        assert_eq!(nack.message.as_deref(), Some("Forbidden"));
    }

    #[tokio::test]
    async fn test_unknown_type_relayed_to_everyone() {
        let mut room = room(false);
        let raw = r#"{"type":"diceRoll","expr":"2d10"}"#;

        room.router.route(&room.requester, raw);

        assert_eq!(next(&mut room.peer_rx).await, raw);
        assert_eq!(next(&mut room.requester_rx).await, raw);
        assert!(room.requester_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_ignored() {
        let mut room = room(false);
        room.router.route(&room.requester, "{not json");
        room.router.route(&room.requester, r#"{"type":"diceRoll"}"#);

        // Only the relay of the second frame arrives.
        let first = next(&mut room.requester_rx).await;
        assert_eq!(
            serde_json::from_str::<Value>(&first).unwrap()["type"],
            "diceRoll"
        );
    }

    #[tokio::test]
    async fn test_chat_message_skips_sender() {
        let mut room = room(false);
        let raw = r#"{"type":"chatMessage","eventID":"c1","body":"hi"}"#;

        room.router.route(&room.requester, raw);

        assert_eq!(next(&mut room.peer_rx).await, raw);
        let ack = next_response(&mut room.requester_rx).await;
        assert_eq!(ack, Response::ack("c1", None));
    }

    #[tokio::test]
    async fn test_blank_chat_message_rejected() {
        let mut room = room(false);
        room.router
            .route(&room.requester, r#"{"type":"chatMessage","body":"   "}"#);

        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack.event_id, "");
        assert!(!nack.ok);
        assert!(room.peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_character_notifies_whole_room() {
        let mut room = room(false);
        room.router
            .route(&room.requester, r#"{"type":"newCharacter","eventID":"n1"}"#);

        let notice: Value = serde_json::from_str(&next(&mut room.peer_rx).await).unwrap();
        assert_eq!(notice["type"], "newCharacterItem");
        assert_eq!(notice["eventID"], "n1");
        assert_eq!(notice["userID"], 1);
        let sheet_id = notice["sheetID"].as_u64().unwrap();

        let (ack, own) = response_and_relay(&mut room.requester_rx).await;
        assert_eq!(ack, Response::ack("n1", Some(0)));
        assert_eq!(serde_json::from_str::<Value>(&own).unwrap(), notice);

        let sheet = room.store.load(sheet_id).unwrap();
        assert_eq!((sheet.owner_id, sheet.room_id), (1, 10));
        assert_eq!(sheet.visibility, Visibility::HideFromPlayers);
    }

    #[tokio::test]
    async fn test_delete_character_relayed_to_everyone() {
        let mut room = room(false);
        let raw = json!({"type": "deleteCharacter", "eventID": "d1", "sheetID": room.sheet_id})
            .to_string();

        room.router.route(&room.requester, &raw);

        assert_eq!(next(&mut room.peer_rx).await, raw);
        let (ack, own) = response_and_relay(&mut room.requester_rx).await;
        assert_eq!(ack, Response::ack("d1", None));
        assert_eq!(own, raw);
        assert!(room.store.load(room.sheet_id).is_err());
    }

    #[tokio::test]
    async fn test_visibility_change_is_owner_only() {
        let mut room = room(false);
        room.store
            .set_member_role(10, 5, Some(RoomRole::Gamemaster))
            .unwrap();
        let raw = json!({
            "type": "changeSheetVisibility",
            "eventID": "v1",
            "sheetID": room.sheet_id.to_string(),
            "visibility": "everyone_can_edit"
        })
        .to_string();
        let gamemaster = ClientContext {
            user_id: 5,
            ..room.requester.clone()
        };

        room.router.route(&gamemaster, &raw);
        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack.code, Some(ErrorCode::Conflict));
        assert!(room.peer_rx.try_recv().is_err());

        room.router.route(&room.requester, &raw);
        assert_eq!(next(&mut room.peer_rx).await, raw);
        let (ack, own) = response_and_relay(&mut room.requester_rx).await;
        assert_eq!(ack, Response::ack("v1", Some(1)));
        assert_eq!(own, raw);
    }

    #[tokio::test]
    async fn test_invalid_visibility_is_validation() {
        let mut room = room(false);
        let raw = json!({
            "type": "changeSheetVisibility",
            "eventID": "v2",
            "sheetID": room.sheet_id,
            "visibility": "public"
        })
        .to_string();

        room.router.route(&room.requester, &raw);

        let nack = next_response(&mut room.requester_rx).await;
        assert_eq!(nack.event_id, "v2");
        assert_eq!(nack.code, Some(ErrorCode::Validation));
        assert_eq!(room.store.load(room.sheet_id).unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_change_player_role() {
        let mut room = room(false);
        room.store
            .set_member_role(10, 1, Some(RoomRole::Gamemaster))
            .unwrap();
        room.store.set_member_role(10, 2, Some(RoomRole::Player)).unwrap();
        let raw = r#"{"type":"changePlayerRole","eventID":"r1","userID":2,"role":"gamemaster"}"#;

        room.router.route(&room.requester, raw);

        assert_eq!(next(&mut room.peer_rx).await, raw);
        assert_eq!(
            next_response(&mut room.requester_rx).await,
            Response::ack("r1", None)
        );
        assert_eq!(
            room.store.member_role(10, 2).unwrap(),
            Some(RoomRole::Gamemaster)
        );
    }
}

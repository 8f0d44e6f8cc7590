// Transport gateway: one task per connection, speaking quillsync-collab.v1.
//
// The socket loop owns the WebSocket exclusively. Everything addressed to
// this connection from elsewhere (broadcasts, eviction announcements) goes
// through the connection's outbound mpsc channel and is written to the
// socket from the same loop, so frames from one room arrive in the order
// the reconciler produced them.

use super::protocol as ws_protocol;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    GatewayError,
};
use crate::identity::{JwtIdentityService, UserIdentity};
use crate::room::RoomRegistry;
use crate::store::DocumentStore;
use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use quillsync_common::op::Operation;
use quillsync_common::protocol::ws::{SelectionRange, WsMessage};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 45;
pub const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<RoomRegistry>,
    pub identity: Arc<JwtIdentityService>,
    pub store: DocumentStore,
}

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsUpgradeQuery {
    token: Option<String>,
}

/// Authenticate, then upgrade. Browsers cannot set headers on a WebSocket
/// handshake, so the token is accepted from `?token=` as well as from a
/// Bearer header; the header wins when both are present.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<WsUpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = bearer_token(&headers).or(query.token) else {
        return GatewayError::new(ErrorCode::AuthInvalidToken, "missing connection token")
            .into_response();
    };

    let identity = match state.identity.resolve_token(&token) {
        Ok(identity) => identity,
        Err(error) => {
            warn!(error = ?error, "rejected websocket connection token");
            return GatewayError::from_code(ErrorCode::AuthInvalidToken).into_response();
        }
    };

    let Ok(ws) = ws else {
        return GatewayError::new(ErrorCode::ValidationFailed, "websocket upgrade required")
            .into_response();
    };

    let request_id =
        current_request_id().unwrap_or_else(|| request_id_from_headers_or_generate(&headers));

    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, identity, socket)).await;
        })
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
                .into(),
        })))
        .await;
}

async fn handle_socket(state: GatewayState, identity: UserIdentity, mut socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<WsMessage>();
    let mut joined: Vec<String> = Vec::new();

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_SECS, disconnects if
    // no pong (or other inbound traffic) arrives within HEARTBEAT_TIMEOUT_SECS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_seen = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS);

    debug!(participant_id = %identity.participant_id, "websocket connected");

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    warn!(
                        participant_id = %identity.participant_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        last_seen = Instant::now();
                        state.registry.touch_participant(&joined, &identity.participant_id).await;

                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                let invalid = WsMessage::Error {
                                    code: "SYNC_INVALID_MESSAGE".to_owned(),
                                    message: "invalid websocket frame payload".to_owned(),
                                    retryable: false,
                                    document_id: None,
                                };
                                if ws_protocol::send_ws_message(&mut socket, &invalid).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let reply = match inbound {
                            WsMessage::Join { document_id, participant_id, display_name } => {
                                handle_join(
                                    &state,
                                    &identity,
                                    &outbound_sender,
                                    &mut joined,
                                    document_id,
                                    participant_id,
                                    display_name,
                                )
                                .await
                                .map(Some)
                            }
                            WsMessage::Edit { document_id, op } => {
                                handle_edit(&state, &identity, &joined, document_id, op)
                                    .await
                                    .map(|()| None)
                            }
                            WsMessage::Cursor { document_id, participant_id, position, selection } => {
                                handle_cursor(
                                    &state,
                                    &identity,
                                    &joined,
                                    document_id,
                                    participant_id,
                                    position,
                                    selection,
                                )
                                .await
                                .map(|()| None)
                            }
                            WsMessage::Resync { document_id } => {
                                handle_resync(&state, &joined, document_id).await.map(Some)
                            }
                            WsMessage::Leave { document_id, participant_id } => {
                                handle_leave(
                                    &state,
                                    &identity,
                                    &mut joined,
                                    document_id,
                                    participant_id,
                                )
                                .await
                                .map(|()| None)
                            }
                            _ => Err(WsMessage::Error {
                                code: "SYNC_UNSUPPORTED_MESSAGE".to_owned(),
                                message: "message type is not accepted from clients".to_owned(),
                                retryable: false,
                                document_id: None,
                            }),
                        };

                        let outcome = match reply {
                            Ok(Some(message)) | Err(message) => {
                                ws_protocol::send_ws_message(&mut socket, &message).await
                            }
                            Ok(None) => Ok(()),
                        };
                        if outcome.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        last_seen = Instant::now();
                        state.registry.touch_participant(&joined, &identity.participant_id).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_seen = Instant::now();
                        state.registry.touch_participant(&joined, &identity.participant_id).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    // Disconnect counts as leaving every joined room.
    state.registry.disconnect(&joined, &identity.participant_id).await;
    debug!(participant_id = %identity.participant_id, "websocket disconnected");
}

fn not_joined_error(document_id: &str) -> WsMessage {
    WsMessage::Error {
        code: "SYNC_NOT_JOINED".to_owned(),
        message: "join the document before sending this message".to_owned(),
        retryable: false,
        document_id: Some(document_id.to_owned()),
    }
}

fn identity_mismatch_error(document_id: &str) -> WsMessage {
    WsMessage::Error {
        code: "AUTH_IDENTITY_MISMATCH".to_owned(),
        message: "frame identity does not match the connection token".to_owned(),
        retryable: false,
        document_id: Some(document_id.to_owned()),
    }
}

/// Enter a room. The participant id must match the connection token; the
/// display name on the frame wins over the token's so a client can present
/// differently per document.
pub(crate) async fn handle_join(
    state: &GatewayState,
    identity: &UserIdentity,
    outbound: &mpsc::UnboundedSender<WsMessage>,
    joined: &mut Vec<String>,
    document_id: String,
    participant_id: String,
    display_name: String,
) -> Result<WsMessage, WsMessage> {
    if participant_id != identity.participant_id {
        return Err(identity_mismatch_error(&document_id));
    }

    let effective = UserIdentity {
        participant_id: identity.participant_id.clone(),
        display_name: if display_name.trim().is_empty() {
            identity.display_name.clone()
        } else {
            display_name
        },
    };

    let (_room, snapshot) =
        state.registry.join(&document_id, &effective, outbound.clone()).await;

    if !joined.contains(&document_id) {
        joined.push(document_id.clone());
    }

    Ok(WsMessage::JoinAck {
        document_id,
        revision: snapshot.revision,
        content: snapshot.content,
        participants: snapshot.participants,
    })
}

/// Reconcile one edit. The sender gets no direct reply on success; the
/// `edit_applied` broadcast reaches it through its own outbound channel,
/// the same way it reaches everyone else.
pub(crate) async fn handle_edit(
    state: &GatewayState,
    identity: &UserIdentity,
    joined: &[String],
    document_id: String,
    op: Operation,
) -> Result<(), WsMessage> {
    if !joined.iter().any(|id| id == &document_id) {
        return Err(not_joined_error(&document_id));
    }
    if op.author_id != identity.participant_id {
        return Err(identity_mismatch_error(&document_id));
    }
    let Some(room) = state.registry.room(&document_id).await else {
        return Err(not_joined_error(&document_id));
    };

    match room.reconciler.commit(op).await {
        Ok(applied) => {
            let message = WsMessage::EditApplied {
                document_id: document_id.clone(),
                ops: applied.ops.clone(),
                revision: applied.revision,
            };
            state.registry.broadcast_to_room(&room, &message).await;

            // Persistence is a side effect off the broadcast path.
            let store = state.store.clone();
            tokio::spawn(async move {
                store
                    .append_operation(&document_id, applied.ops, applied.revision, applied.content)
                    .await;
            });
            Ok(())
        }
        Err(error) => Err(WsMessage::EditRejected {
            document_id,
            code: error.code().to_owned(),
            message: error.to_string(),
        }),
    }
}

/// Fan a cursor frame out to everyone else in the room. Best-effort; a
/// cursor for a document the sender never joined is a protocol error.
pub(crate) async fn handle_cursor(
    state: &GatewayState,
    identity: &UserIdentity,
    joined: &[String],
    document_id: String,
    participant_id: String,
    position: usize,
    selection: Option<SelectionRange>,
) -> Result<(), WsMessage> {
    if participant_id != identity.participant_id {
        return Err(identity_mismatch_error(&document_id));
    }
    if !joined.iter().any(|id| id == &document_id) {
        return Err(not_joined_error(&document_id));
    }
    let Some(room) = state.registry.room(&document_id).await else {
        return Err(not_joined_error(&document_id));
    };

    match room.update_cursor(&participant_id, position, selection).await {
        Some(update) => {
            state.registry.broadcast_to_room_excluding(&room, &update, &participant_id).await;
            Ok(())
        }
        None => Err(not_joined_error(&document_id)),
    }
}

/// Full-content recovery after a rejected edit.
pub(crate) async fn handle_resync(
    state: &GatewayState,
    joined: &[String],
    document_id: String,
) -> Result<WsMessage, WsMessage> {
    if !joined.iter().any(|id| id == &document_id) {
        return Err(not_joined_error(&document_id));
    }
    let Some(room) = state.registry.room(&document_id).await else {
        return Err(not_joined_error(&document_id));
    };

    let (content, revision) = room.reconciler.snapshot().await;
    Ok(WsMessage::ResyncAck { document_id, revision, content })
}

/// Explicit departure from one room; the connection stays up.
pub(crate) async fn handle_leave(
    state: &GatewayState,
    identity: &UserIdentity,
    joined: &mut Vec<String>,
    document_id: String,
    participant_id: String,
) -> Result<(), WsMessage> {
    if participant_id != identity.participant_id {
        return Err(identity_mismatch_error(&document_id));
    }
    joined.retain(|id| id != &document_id);
    state.registry.leave(&document_id, &participant_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quillsync_common::op::Operation;
    use quillsync_common::protocol::ws::WsMessage;
    use tokio::sync::mpsc;

    use super::{
        handle_cursor, handle_edit, handle_join, handle_leave, handle_resync, GatewayState,
    };
    use crate::identity::{JwtIdentityService, UserIdentity};
    use crate::room::RoomRegistry;
    use crate::store::DocumentStore;

    fn test_state() -> GatewayState {
        let identity = Arc::new(
            JwtIdentityService::new("quillsync_test_secret_that_is_long_enough!!")
                .expect("test identity service should initialize"),
        );
        let store = DocumentStore::in_memory();
        let registry = Arc::new(RoomRegistry::new(store.clone()));
        GatewayState { registry, identity, store }
    }

    fn identity(id: &str) -> UserIdentity {
        UserIdentity { participant_id: id.to_owned(), display_name: id.to_uppercase() }
    }

    async fn join(
        state: &GatewayState,
        id: &str,
        document_id: &str,
    ) -> (Vec<String>, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut joined = Vec::new();
        handle_join(
            state,
            &identity(id),
            &tx,
            &mut joined,
            document_id.to_owned(),
            id.to_owned(),
            String::new(),
        )
        .await
        .expect("join should succeed");
        (joined, rx)
    }

    #[tokio::test]
    async fn join_ack_carries_snapshot_and_roster() {
        let state = test_state();
        state.store.seed("doc-1", "hello", 2).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut joined = Vec::new();
        let ack = handle_join(
            &state,
            &identity("alice"),
            &tx,
            &mut joined,
            "doc-1".to_owned(),
            "alice".to_owned(),
            "Alice L.".to_owned(),
        )
        .await
        .expect("join should succeed");

        match ack {
            WsMessage::JoinAck { document_id, revision, content, participants } => {
                assert_eq!(document_id, "doc-1");
                assert_eq!(revision, 2);
                assert_eq!(content, "hello");
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].display_name, "Alice L.");
            }
            other => panic!("expected join_ack, got {other:?}"),
        }
        assert_eq!(joined, vec!["doc-1".to_owned()]);
    }

    #[tokio::test]
    async fn join_with_foreign_participant_id_is_rejected() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut joined = Vec::new();

        let rejected = handle_join(
            &state,
            &identity("alice"),
            &tx,
            &mut joined,
            "doc-1".to_owned(),
            "mallory".to_owned(),
            String::new(),
        )
        .await;

        assert!(matches!(
            rejected,
            Err(WsMessage::Error { code, .. }) if code == "AUTH_IDENTITY_MISMATCH"
        ));
        assert!(joined.is_empty());
        assert_eq!(state.registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn edit_requires_a_prior_join() {
        let state = test_state();

        let rejected = handle_edit(
            &state,
            &identity("alice"),
            &[],
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "alice", 0),
        )
        .await;

        assert!(matches!(
            rejected,
            Err(WsMessage::Error { code, .. }) if code == "SYNC_NOT_JOINED"
        ));
    }

    #[tokio::test]
    async fn accepted_edit_reaches_the_sender_as_a_broadcast() {
        let state = test_state();
        let (joined, mut rx) = join(&state, "alice", "doc-1").await;

        handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "alice", 0),
        )
        .await
        .expect("edit should apply");

        match rx.recv().await {
            Some(WsMessage::EditApplied { revision, ops, .. }) => {
                assert_eq!(revision, 1);
                assert_eq!(ops.len(), 1);
            }
            other => panic!("expected edit_applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_edit_fans_out_to_other_participants() {
        let state = test_state();
        let (joined, _alice_rx) = join(&state, "alice", "doc-1").await;
        let (_bob_joined, mut bob_rx) = join(&state, "bob", "doc-1").await;

        handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "alice", 0),
        )
        .await
        .expect("edit should apply");

        // Bob first sees nothing (alice joined before him), then the edit.
        match bob_rx.recv().await {
            Some(WsMessage::EditApplied { ops, .. }) => assert_eq!(ops.len(), 1),
            other => panic!("expected edit_applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_edit_reports_the_error_code() {
        let state = test_state();
        state.store.seed("doc-1", "hello", 0).await;
        let (joined, _rx) = join(&state, "alice", "doc-1").await;

        let rejected = handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::delete(2, 10, "alice", 0),
        )
        .await;

        assert!(matches!(
            rejected,
            Err(WsMessage::EditRejected { code, .. }) if code == "EDIT_OUT_OF_BOUNDS"
        ));
    }

    #[tokio::test]
    async fn edit_with_foreign_author_id_is_rejected() {
        let state = test_state();
        let (joined, _rx) = join(&state, "alice", "doc-1").await;

        let rejected = handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "mallory", 0),
        )
        .await;

        assert!(matches!(
            rejected,
            Err(WsMessage::Error { code, .. }) if code == "AUTH_IDENTITY_MISMATCH"
        ));
    }

    #[tokio::test]
    async fn accepted_edit_is_persisted() {
        let state = test_state();
        let (joined, _rx) = join(&state, "alice", "doc-1").await;

        handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "alice", 0),
        )
        .await
        .expect("edit should apply");

        // The persistence task runs off the handler path; let it finish.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(state.store.load_content("doc-1").await, ("hi".to_owned(), 1));
    }

    #[tokio::test]
    async fn cursor_fans_out_excluding_the_sender() {
        let state = test_state();
        let (joined, mut alice_rx) = join(&state, "alice", "doc-1").await;
        let (_bob_joined, mut bob_rx) = join(&state, "bob", "doc-1").await;

        // Drain alice's participant_joined announcement for bob.
        assert!(matches!(alice_rx.recv().await, Some(WsMessage::ParticipantJoined { .. })));

        handle_cursor(&state, &identity("alice"), &joined, "doc-1".to_owned(), "alice".to_owned(), 3, None)
            .await
            .expect("cursor should fan out");

        match bob_rx.recv().await {
            Some(WsMessage::CursorUpdate { participant_id, position, .. }) => {
                assert_eq!(participant_id, "alice");
                assert_eq!(position, 3);
            }
            other => panic!("expected cursor_update, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resync_returns_the_current_snapshot() {
        let state = test_state();
        state.store.seed("doc-1", "hello", 5).await;
        let (joined, _rx) = join(&state, "alice", "doc-1").await;

        let ack = handle_resync(&state, &joined, "doc-1".to_owned())
            .await
            .expect("resync should succeed");

        match ack {
            WsMessage::ResyncAck { revision, content, .. } => {
                assert_eq!(revision, 5);
                assert_eq!(content, "hello");
            }
            other => panic!("expected resync_ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_then_edit_is_not_joined() {
        let state = test_state();
        let (mut joined, _rx) = join(&state, "alice", "doc-1").await;

        handle_leave(&state, &identity("alice"), &mut joined, "doc-1".to_owned(), "alice".to_owned())
            .await
            .expect("leave should succeed");
        assert!(joined.is_empty());
        assert_eq!(state.registry.room_count().await, 0);

        let rejected = handle_edit(
            &state,
            &identity("alice"),
            &joined,
            "doc-1".to_owned(),
            Operation::insert(0, "hi", "alice", 0),
        )
        .await;
        assert!(matches!(
            rejected,
            Err(WsMessage::Error { code, .. }) if code == "SYNC_NOT_JOINED"
        ));
    }
}

// WebSocket message types for the quillsync-collab.v1 protocol.
//
// A closed schema: every frame is one of these variants, validated at the
// transport boundary before any of it reaches room logic.

use serde::{Deserialize, Serialize};

use crate::op::Operation;

pub const PROTOCOL_VERSION: &str = "quillsync-collab.v1";

/// All message types in the quillsync-collab.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: enter a document's room.
    Join {
        document_id: String,
        participant_id: String,
        display_name: String,
    },

    /// Server -> Client: room snapshot for the joiner.
    JoinAck {
        document_id: String,
        revision: u64,
        content: String,
        participants: Vec<ParticipantInfo>,
    },

    /// Server -> Client (broadcast): a participant entered the room.
    ParticipantJoined {
        document_id: String,
        participant_id: String,
        display_name: String,
        color: String,
    },

    /// Client -> Server: leave a document's room.
    Leave {
        document_id: String,
        participant_id: String,
    },

    /// Server -> Client (broadcast): a participant left, disconnected, or
    /// timed out.
    ParticipantLeft {
        document_id: String,
        participant_id: String,
    },

    /// Client -> Server: one edit against the operation's base revision.
    Edit {
        document_id: String,
        op: Operation,
    },

    /// Server -> Client (broadcast, including the sender): the accepted
    /// edit, possibly rebased into a short composed span sequence, plus
    /// the revision it produced.
    EditApplied {
        document_id: String,
        ops: Vec<Operation>,
        revision: u64,
    },

    /// Server -> Client (sender only): the edit was rejected; room state
    /// is unchanged.
    EditRejected {
        document_id: String,
        code: String,
        message: String,
    },

    /// Client -> Server: cursor/selection moved. Best-effort,
    /// last-write-wins.
    Cursor {
        document_id: String,
        participant_id: String,
        position: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<SelectionRange>,
    },

    /// Server -> Client (broadcast): another participant's cursor.
    CursorUpdate {
        document_id: String,
        participant_id: String,
        position: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<SelectionRange>,
        color: String,
    },

    /// Client -> Server: request a fresh snapshot after a stale-revision
    /// rejection. The recovery path, never the steady state.
    Resync {
        document_id: String,
    },

    /// Server -> Client: full canonical content at the current revision.
    ResyncAck {
        document_id: String,
        revision: u64,
        content: String,
    },

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<String>,
    },
}

/// A room member as seen by other clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub color: String,
}

/// Cursor selection range; `None` upstream means a collapsed caret.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    /// Anchor position (selection start).
    pub anchor: usize,
    /// Head position (selection end / caret).
    pub head: usize,
}

// Synchronization error taxonomy shared by server and clients.

use thiserror::Error;

/// Errors produced while validating, transforming, or applying edits.
///
/// Every variant is a per-operation failure: the originating edit is
/// rejected and room state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The operation addresses characters beyond the current document length.
    /// Positions are never clamped; the edit is rejected outright.
    #[error("operation out of bounds: position {position} + length {length} exceeds document length {content_len}")]
    OutOfBounds {
        position: usize,
        length: usize,
        content_len: usize,
    },

    /// The client claims a base revision the server has not reached yet.
    /// Cannot happen under FIFO delivery from a single server, so it is
    /// treated as a protocol violation and the client must resynchronize.
    #[error("stale revision: client base revision {client} is ahead of server revision {server}")]
    StaleRevision { client: u64, server: u64 },

    /// Schema-valid but semantically malformed operation (e.g. an insert
    /// without a payload, or a payload whose length disagrees with `length`).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Stable wire code for `edit_rejected` / `error` messages.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "EDIT_OUT_OF_BOUNDS",
            Self::StaleRevision { .. } => "EDIT_STALE_REVISION",
            Self::InvalidOperation(_) => "EDIT_INVALID_OPERATION",
        }
    }

    /// Whether the client can recover by re-joining for a fresh snapshot.
    pub const fn recoverable_by_resync(&self) -> bool {
        matches!(self, Self::StaleRevision { .. })
    }
}

// Presence: cursors, selections, and participant colors.
//
// Presence is best-effort and last-write-wins; it shares none of the
// reconciler's ordering guarantees. Cursor state is written through the
// room registry's participant map, never duplicated elsewhere.

use std::hash::{Hash, Hasher};

use quillsync_common::protocol::ws::SelectionRange;

/// Last-known cursor for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub position: usize,
    pub selection: Option<SelectionRange>,
}

/// Fixed palette shared with clients; dark-theme friendly.
const PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#d19a66", "#56b6c2", "#e5c07b", "#abb2bf",
];

/// Deterministic color for a participant id.
///
/// Every replica (and every rejoin) maps the same id to the same color, so
/// color can be derived server-side and broadcast rather than negotiated.
pub fn color_for(participant_id: &str) -> &'static str {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    participant_id.hash(&mut hasher);
    PALETTE[(hasher.finish() % PALETTE.len() as u64) as usize]
}

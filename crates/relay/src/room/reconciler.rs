// Per-room reconciliation: the single serialization point for edits.
//
// One reconciler per room; its mutex is the room's "one operation at a
// time" invariant. Different rooms hold different mutexes, so rooms
// reconcile concurrently. The reconciler exclusively owns the canonical
// content and revision counter; every accepted edit advances the revision
// by exactly one, and a rejected edit leaves both untouched.

use std::collections::VecDeque;

use quillsync_common::error::SyncError;
use quillsync_common::op::Operation;
use quillsync_common::transform::{
    apply_components, components_of, rebase_components, spans_of, Components,
};
use tokio::sync::Mutex;

/// Rebase window. An edit based further back than this many revisions can
/// no longer be transformed and the client is told to resynchronize.
const MAX_HISTORY: usize = 1024;

/// An accepted edit: the (possibly rebased) span sequence to broadcast,
/// the revision it produced, and the resulting canonical content for the
/// persistence side effect.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEdit {
    pub ops: Vec<Operation>,
    pub revision: u64,
    pub content: String,
}

#[derive(Debug)]
struct HistoryEntry {
    components: Components,
    author_id: String,
}

#[derive(Debug)]
struct DocState {
    content: String,
    revision: u64,
    history: VecDeque<HistoryEntry>,
}

#[derive(Debug)]
pub struct Reconciler {
    state: Mutex<DocState>,
}

impl Reconciler {
    pub fn new(content: String, revision: u64) -> Self {
        Self {
            state: Mutex::new(DocState { content, revision, history: VecDeque::new() }),
        }
    }

    /// Canonical content and revision, for join/resync snapshots.
    pub async fn snapshot(&self) -> (String, u64) {
        let state = self.state.lock().await;
        (state.content.clone(), state.revision)
    }

    /// Accept or reject one inbound edit.
    ///
    /// Fully applies or fully rejects: any error leaves content, revision,
    /// and history untouched.
    pub async fn commit(&self, mut op: Operation) -> Result<AppliedEdit, SyncError> {
        op.validate()?;

        let mut state = self.state.lock().await;

        if op.base_revision > state.revision {
            // Cannot happen under FIFO delivery from a single server;
            // treat as a protocol violation.
            return Err(SyncError::StaleRevision {
                client: op.base_revision,
                server: state.revision,
            });
        }

        let behind = (state.revision - op.base_revision) as usize;
        if behind > state.history.len() {
            return Err(SyncError::InvalidOperation(format!(
                "base revision {} predates the retained rebase window",
                op.base_revision
            )));
        }

        // Rebase across everything applied since the edit's base revision.
        let mut components = components_of(&op);
        let start = state.history.len() - behind;
        for entry in state.history.iter().skip(start) {
            components =
                rebase_components(&components, &op.author_id, &entry.components, &entry.author_id);
        }

        let content = apply_components(&state.content, &components)?;

        state.revision += 1;
        state.content = content.clone();
        state
            .history
            .push_back(HistoryEntry { components: components.clone(), author_id: op.author_id.clone() });
        if state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }

        Ok(AppliedEdit { ops: spans_of(&components, &op), revision: state.revision, content })
    }
}

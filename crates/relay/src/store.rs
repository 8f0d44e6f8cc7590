// Document persistence collaborator.
//
// Durable storage is external to the synchronization core; the reconciler
// only needs `load_content` when a room is created and `append_operation`
// as an async durability side effect after an edit is accepted. A durable
// backend slots in as a new enum variant without touching room logic.

use std::collections::HashMap;
use std::sync::Arc;

use quillsync_common::op::Operation;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct StoredDocument {
    pub content: String,
    pub revision: u64,
    pub log: Vec<LoggedEdit>,
}

/// One accepted edit as persisted: the (possibly rebased) span sequence and
/// the revision it produced.
#[derive(Debug, Clone)]
pub struct LoggedEdit {
    pub ops: Vec<Operation>,
    pub revision: u64,
}

#[derive(Clone)]
pub enum DocumentStore {
    Memory(Arc<RwLock<HashMap<String, StoredDocument>>>),
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Content and revision for a document; unknown ids start as an empty
    /// document at revision 0.
    pub async fn load_content(&self, document_id: &str) -> (String, u64) {
        match self {
            Self::Memory(docs) => docs
                .read()
                .await
                .get(document_id)
                .map(|doc| (doc.content.clone(), doc.revision))
                .unwrap_or_default(),
        }
    }

    /// Record an accepted edit. Invoked off the broadcast hot path.
    pub async fn append_operation(
        &self,
        document_id: &str,
        ops: Vec<Operation>,
        revision: u64,
        content: String,
    ) {
        match self {
            Self::Memory(docs) => {
                let mut guard = docs.write().await;
                let doc = guard.entry(document_id.to_owned()).or_default();
                doc.log.push(LoggedEdit { ops, revision });
                doc.content = content;
                doc.revision = doc.revision.max(revision);
            }
        }
    }

    /// Seed a document, for tests and single-node development.
    pub async fn seed(&self, document_id: &str, content: &str, revision: u64) {
        match self {
            Self::Memory(docs) => {
                let mut guard = docs.write().await;
                guard.insert(
                    document_id.to_owned(),
                    StoredDocument { content: content.to_owned(), revision, log: Vec::new() },
                );
            }
        }
    }
}

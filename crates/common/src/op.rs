// The operation model: a single typed edit against a specific base revision.
//
// Positions and lengths are Unicode scalar value (char) offsets, never
// bytes, so splices stay on character boundaries for any client language.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::SyncError;

/// The three edit primitives. `Retain` never arrives as a standalone edit;
/// it only appears inside composed operation sequences produced by the
/// transform engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Retain,
}

/// One atomic edit.
///
/// Invariants (enforced by [`Operation::validate`]):
/// - `Insert.length == payload.chars().count()` and the payload is NFC
///   normalized.
/// - `Delete`/`Retain` carry no payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub position: usize,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub author_id: String,
    pub base_revision: u64,
    pub issued_at: DateTime<Utc>,
}

impl Operation {
    pub fn insert(
        position: usize,
        payload: impl Into<String>,
        author_id: impl Into<String>,
        base_revision: u64,
    ) -> Self {
        let payload: String = payload.into().nfc().collect();
        Self {
            kind: OpKind::Insert,
            position,
            length: payload.chars().count(),
            payload: Some(payload),
            author_id: author_id.into(),
            base_revision,
            issued_at: Utc::now(),
        }
    }

    pub fn delete(
        position: usize,
        length: usize,
        author_id: impl Into<String>,
        base_revision: u64,
    ) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            length,
            payload: None,
            author_id: author_id.into(),
            base_revision,
            issued_at: Utc::now(),
        }
    }

    pub fn retain(length: usize, author_id: impl Into<String>, base_revision: u64) -> Self {
        Self {
            kind: OpKind::Retain,
            position: 0,
            length,
            payload: None,
            author_id: author_id.into(),
            base_revision,
            issued_at: Utc::now(),
        }
    }

    /// Validate the operation's internal invariants and normalize its
    /// payload to NFC. Must be called on every operation that crossed the
    /// transport boundary before it reaches the reconciler.
    pub fn validate(&mut self) -> Result<(), SyncError> {
        match self.kind {
            OpKind::Insert => {
                let payload = self
                    .payload
                    .take()
                    .ok_or_else(|| SyncError::InvalidOperation("insert without payload".into()))?;
                let normalized: String = payload.nfc().collect();
                let char_len = normalized.chars().count();
                if char_len == 0 {
                    return Err(SyncError::InvalidOperation("empty insert payload".into()));
                }
                if self.length != char_len {
                    return Err(SyncError::InvalidOperation(format!(
                        "insert length {} disagrees with payload length {char_len}",
                        self.length
                    )));
                }
                self.payload = Some(normalized);
                Ok(())
            }
            OpKind::Delete | OpKind::Retain => {
                if self.payload.is_some() {
                    return Err(SyncError::InvalidOperation(format!(
                        "{:?} must not carry a payload",
                        self.kind
                    )));
                }
                if self.kind == OpKind::Delete && self.length == 0 {
                    return Err(SyncError::InvalidOperation("empty delete range".into()));
                }
                Ok(())
            }
        }
    }
}

/// Apply one operation to document content, producing the new content.
///
/// Errors with [`SyncError::OutOfBounds`] when the operation addresses
/// characters past the end of `content`. Never clamps.
pub fn apply(content: &str, op: &Operation) -> Result<String, SyncError> {
    let content_len = content.chars().count();
    match op.kind {
        OpKind::Insert => {
            if op.position > content_len {
                return Err(SyncError::OutOfBounds {
                    position: op.position,
                    length: op.length,
                    content_len,
                });
            }
            let payload = op
                .payload
                .as_deref()
                .ok_or_else(|| SyncError::InvalidOperation("insert without payload".into()))?;
            let byte_pos = char_to_byte_index(content, op.position);
            let mut next = String::with_capacity(content.len() + payload.len());
            next.push_str(&content[..byte_pos]);
            next.push_str(payload);
            next.push_str(&content[byte_pos..]);
            Ok(next)
        }
        OpKind::Delete => {
            // checked_add: position and length come off the wire unvalidated.
            match op.position.checked_add(op.length) {
                Some(end) if end <= content_len => {}
                _ => {
                    return Err(SyncError::OutOfBounds {
                        position: op.position,
                        length: op.length,
                        content_len,
                    });
                }
            }
            let start = char_to_byte_index(content, op.position);
            let end = char_to_byte_index(content, op.position + op.length);
            let mut next = String::with_capacity(content.len() - (end - start));
            next.push_str(&content[..start]);
            next.push_str(&content[end..]);
            Ok(next)
        }
        // Retain only marks skipped characters inside composed sequences.
        OpKind::Retain => Ok(content.to_owned()),
    }
}

/// Apply a composed operation sequence left to right. Each span addresses
/// the content produced by the spans before it.
pub fn apply_all(content: &str, ops: &[Operation]) -> Result<String, SyncError> {
    let mut current = content.to_owned();
    for op in ops {
        current = apply(&current, op)?;
    }
    Ok(current)
}

fn char_to_byte_index(content: &str, char_index: usize) -> usize {
    content
        .char_indices()
        .nth(char_index)
        .map(|(byte_index, _)| byte_index)
        .unwrap_or(content.len())
}

#[cfg(test)]
mod tests {
    use super::{apply, apply_all, OpKind, Operation};
    use crate::error::SyncError;

    #[test]
    fn insert_splices_payload() {
        let op = Operation::insert(5, " world", "alice", 0);
        assert_eq!(apply("hello", &op).unwrap(), "hello world");
    }

    #[test]
    fn insert_at_start_and_middle() {
        let start = Operation::insert(0, "ab", "alice", 0);
        assert_eq!(apply("cd", &start).unwrap(), "abcd");

        let middle = Operation::insert(1, "X", "alice", 0);
        assert_eq!(apply("cd", &middle).unwrap(), "cXd");
    }

    #[test]
    fn delete_removes_range() {
        let op = Operation::delete(0, 5, "bob", 0);
        assert_eq!(apply("hello world", &op).unwrap(), " world");
    }

    #[test]
    fn retain_is_a_no_op() {
        let op = Operation::retain(3, "alice", 0);
        assert_eq!(apply("hello", &op).unwrap(), "hello");
    }

    #[test]
    fn insert_past_end_is_out_of_bounds() {
        let op = Operation::insert(6, "!", "alice", 0);
        assert_eq!(
            apply("hello", &op),
            Err(SyncError::OutOfBounds { position: 6, length: 1, content_len: 5 })
        );
    }

    #[test]
    fn delete_near_usize_max_does_not_overflow() {
        let op = Operation::delete(usize::MAX - 1, 2, "bob", 0);
        assert_eq!(
            apply("hello", &op),
            Err(SyncError::OutOfBounds { position: usize::MAX - 1, length: 2, content_len: 5 })
        );
    }

    #[test]
    fn delete_past_end_is_out_of_bounds_not_clamped() {
        let op = Operation::delete(3, 10, "bob", 0);
        assert_eq!(
            apply("hello", &op),
            Err(SyncError::OutOfBounds { position: 3, length: 10, content_len: 5 })
        );
    }

    #[test]
    fn positions_are_char_offsets_not_bytes() {
        // "héllo" is 6 bytes but 5 chars; delete chars 1..3 ("él").
        let op = Operation::delete(1, 2, "bob", 0);
        assert_eq!(apply("héllo", &op).unwrap(), "hlo");

        let insert = Operation::insert(2, "ß", "alice", 0);
        assert_eq!(apply("héllo", &insert).unwrap(), "héßllo");
    }

    #[test]
    fn validate_rejects_length_payload_mismatch() {
        let mut op = Operation::insert(0, "abc", "alice", 0);
        op.length = 2;
        assert!(matches!(op.validate(), Err(SyncError::InvalidOperation(_))));
    }

    #[test]
    fn validate_rejects_insert_without_payload() {
        let mut op = Operation::insert(0, "abc", "alice", 0);
        op.payload = None;
        assert!(matches!(op.validate(), Err(SyncError::InvalidOperation(_))));
    }

    #[test]
    fn validate_rejects_delete_with_payload() {
        let mut op = Operation::delete(0, 2, "bob", 0);
        op.payload = Some("x".into());
        assert!(matches!(op.validate(), Err(SyncError::InvalidOperation(_))));
    }

    #[test]
    fn validate_normalizes_payload_to_nfc() {
        // "e" + combining acute accent composes to a single char.
        let mut op = Operation {
            kind: OpKind::Insert,
            position: 0,
            length: 1,
            payload: Some("e\u{0301}".into()),
            author_id: "alice".into(),
            base_revision: 0,
            issued_at: chrono::Utc::now(),
        };
        op.validate().unwrap();
        assert_eq!(op.payload.as_deref(), Some("\u{00e9}"));
        assert_eq!(op.length, 1);
    }

    #[test]
    fn apply_all_runs_spans_sequentially() {
        let ops = vec![
            Operation::delete(6, 5, "bob", 0),
            Operation::delete(0, 5, "bob", 0),
        ];
        assert_eq!(apply_all("hello world", &ops).unwrap(), " ");
    }

    #[test]
    fn serde_round_trip_keeps_kind_tag() {
        let op = Operation::insert(2, "hi", "alice", 7);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "insert");
        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }
}

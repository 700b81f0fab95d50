//! Operation-transform document model.
//!
//! One [`DocumentReplica`] per room owns the text, a monotonically
//! increasing version counter, and the ordered log of applied operations.
//! Concurrent edits are reconciled with a position-shift transform: an
//! incoming operation's position is adjusted against every logged operation
//! the submitter had not yet seen, in log order.
//!
//! This is deliberately not a full Jupiter-style OT. Same-position concurrent
//! inserts are kept in arrival order with no tie-breaking, which is
//! deterministic per instance but not "fair". Positions are character
//! (Unicode scalar) based.
//!
//! Pure in-memory state machine — no I/O, no locking; callers serialize
//! access per room.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of edit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
}

/// A single insert or delete edit.
///
/// Immutable once created; transforming produces a new value. For deletes
/// the *length* of `content` determines the span to remove — the content
/// itself is discarded, so placeholder characters of the right count work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "crate::now_secs")]
    pub timestamp: f64,
    #[serde(default)]
    pub version: u64,
}

impl Operation {
    /// Create an insert operation.
    pub fn insert(client_id: impl Into<String>, position: i64, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            content: content.into(),
            client_id: client_id.into(),
            timestamp: crate::now_secs(),
            version: 0,
        }
    }

    /// Create a delete operation. `content` only sets the span length.
    pub fn delete(client_id: impl Into<String>, position: i64, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            content: content.into(),
            client_id: client_id.into(),
            timestamp: crate::now_secs(),
            version: 0,
        }
    }

    /// Payload length in characters.
    fn content_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Snapshot of a document's current state, as sent in `init` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub document_id: String,
    pub content: String,
    pub version: u64,
}

/// Why an operation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Malformed operation: position below zero.
    NegativePosition,
    /// The room was closed; the replica no longer accepts edits.
    DocumentClosed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativePosition => write!(f, "negative position"),
            Self::DocumentClosed => write!(f, "document closed"),
        }
    }
}

/// Result of [`DocumentReplica::apply_operation`].
///
/// `Applied` carries the transformed, version-stamped operation that was
/// actually spliced into the text — this is what gets broadcast, not the
/// submitter's original.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Operation),
    Rejected(RejectReason),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Per-room document state machine.
///
/// Invariant: after construction, `version` counts applied operations and
/// the log replayed from empty reproduces `text` (the text is a cache of the
/// log). `load_snapshot` is the one exception — it seeds text out-of-band
/// and bumps the version so late joiners still catch up correctly.
#[derive(Debug, Clone)]
pub struct DocumentReplica {
    room_id: String,
    text: String,
    version: u64,
    log: Vec<Operation>,
    client_versions: HashMap<String, u64>,
    closed: bool,
}

impl DocumentReplica {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            text: String::new(),
            version: 0,
            log: Vec::new(),
            client_versions: HashMap::new(),
            closed: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn content(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting operations. Applies after this return `Rejected`.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Transform and apply one operation.
    ///
    /// Rejects (without mutating state) on negative position or a closed
    /// document; never panics for well-formed input. At-most-once: each call
    /// applies the operation exactly once or not at all.
    pub fn apply_operation(&mut self, op: Operation) -> ApplyOutcome {
        if self.closed {
            return ApplyOutcome::Rejected(RejectReason::DocumentClosed);
        }
        if op.position < 0 {
            return ApplyOutcome::Rejected(RejectReason::NegativePosition);
        }

        let mut transformed = self.transform(&op);
        let char_len = self.text.chars().count();

        match transformed.kind {
            OperationKind::Insert => {
                // Clamp to append when the position is past the end.
                let pos = (transformed.position as usize).min(char_len);
                let at = byte_index(&self.text, pos);
                self.text.insert_str(at, &transformed.content);
            }
            OperationKind::Delete => {
                let start = (transformed.position as usize).min(char_len);
                let span = transformed.content_len().min(char_len - start);
                let from = byte_index(&self.text, start);
                let to = byte_index(&self.text, start + span);
                self.text.replace_range(from..to, "");
            }
        }

        self.version += 1;
        transformed.version = self.version;
        self.log.push(transformed.clone());
        self.client_versions
            .insert(transformed.client_id.clone(), self.version);

        ApplyOutcome::Applied(transformed)
    }

    /// Shift an operation's position past every logged operation the
    /// submitter had not seen (everything after its last acknowledged
    /// version), in log order.
    fn transform(&self, op: &Operation) -> Operation {
        let last_seen = self.client_versions.get(&op.client_id).copied().unwrap_or(0);
        let mut position = op.position;

        for prior in self.log.iter().filter(|p| p.version > last_seen) {
            let len = prior.content_len() as i64;
            match prior.kind {
                OperationKind::Insert => {
                    if prior.position <= position {
                        position += len;
                    }
                }
                OperationKind::Delete => {
                    if prior.position < position {
                        position -= len.min(position - prior.position);
                    }
                }
            }
        }

        Operation {
            position: position.max(0),
            version: 0,
            ..op.clone()
        }
    }

    /// All applied operations with version greater than `version`, in order.
    /// Used to catch up a reconnecting client.
    pub fn operations_since(&self, version: u64) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| op.version > version)
            .cloned()
            .collect()
    }

    /// Current document state for `init` messages and snapshot persistence.
    pub fn state(&self) -> DocumentState {
        DocumentState {
            document_id: self.room_id.clone(),
            content: self.text.clone(),
            version: self.version,
        }
    }

    /// Seed the text from a persisted snapshot and bump the version.
    ///
    /// Only for initial seeding, never for conflict resolution.
    pub fn load_snapshot(&mut self, content: &str) {
        self.text = content.to_string();
        self.version += 1;
    }
}

/// Byte offset of the `char_pos`-th character, clamped to the end.
fn byte_index(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

use futures::future::BoxFuture;
use kiln_protocol::SessionId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::error::Result;

/// A reversible structured side effect, tagged with enough data to invert
/// it: the created id for `Add`, the prior value for `Update`, the full
/// prior record for `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoOp {
    Add { id: String },
    Update { id: String, prior: Value },
    Delete { record: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoLogEntry {
    pub session: SessionId,
    /// Transcript position at which the side effect happened; rollback
    /// targets are expressed against this index.
    pub message_index: u64,
    /// Monotonic sequence number establishing chronological order across
    /// the whole log.
    pub seq: u64,
    pub op: UndoOp,
}

/// Inverse-application target for undo replay. The core never talks to
/// the side-effecting backend directly; callers bring whatever store the
/// original operations mutated (notebook annotations, task records, ...).
pub trait UndoStore: Send {
    /// Invert an `Add`: delete the record created under `id`.
    fn remove_record<'a>(&'a mut self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Invert an `Update`: restore the prior value under `id`.
    fn restore_record<'a>(&'a mut self, id: &'a str, prior: &'a Value)
    -> BoxFuture<'a, Result<()>>;

    /// Invert a `Delete`: reinsert the full prior record.
    fn reinsert_record<'a>(&'a mut self, record: &'a Value) -> BoxFuture<'a, Result<()>>;
}

/// Message-indexed, append-only record of reversible side effects.
///
/// Unlike the single-active file checkpoint, entries accumulate for the
/// life of a session, which is what makes rollback to *any* earlier
/// message index possible.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UndoLog {
    next_seq: u64,
    entries: Vec<UndoLogEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reversible operation. Returns the assigned sequence
    /// number.
    pub fn append(&mut self, session: SessionId, message_index: u64, op: UndoOp) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(UndoLogEntry {
            session,
            message_index,
            seq,
            op,
        });
        seq
    }

    /// Entries currently recorded for `session` at or after
    /// `message_index`.
    pub fn entries_at_or_after(&self, session: SessionId, message_index: u64) -> Vec<&UndoLogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.session == session && entry.message_index >= message_index)
            .collect()
    }

    /// Undo every effect recorded at or after `target_index`, most recent
    /// first, then prune the replayed entries from the log. Per-entry
    /// failures are logged and skipped; replay continues for the rest.
    /// Returns the number of entries replayed.
    pub async fn rollback_to<S: UndoStore>(
        &mut self,
        session: SessionId,
        target_index: u64,
        store: &mut S,
    ) -> usize {
        let mut replay: Vec<UndoLogEntry> = Vec::new();
        self.entries.retain(|entry| {
            if entry.session == session && entry.message_index >= target_index {
                replay.push(entry.clone());
                false
            } else {
                true
            }
        });
        // Undo the most recent effect first.
        replay.sort_by(|a, b| b.seq.cmp(&a.seq));

        for entry in &replay {
            let outcome = match &entry.op {
                UndoOp::Add { id } => store.remove_record(id).await,
                UndoOp::Update { id, prior } => store.restore_record(id, prior).await,
                UndoOp::Delete { record } => store.reinsert_record(record).await,
            };
            if let Err(err) = outcome {
                warn!(
                    "undo replay failed for seq {} (message index {}): {err}",
                    entry.seq, entry.message_index
                );
            }
        }
        if !replay.is_empty() {
            info!(
                "rolled back {} undo entries for session {session} to index {target_index}",
                replay.len()
            );
        }
        replay.len()
    }
}

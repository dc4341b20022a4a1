use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use kiln_protocol::SessionId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::error::Result;

/// Pre-mutation state of one file, captured at most once per path for the
/// lifetime of the active checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    /// Content before the first mutation of the turn. Empty when the file
    /// did not exist.
    pub prior_content: String,
    pub existed: bool,
}

/// Snapshot set for one turn. One *active* checkpoint exists per session
/// at a time; committing or rolling back destroys it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session: SessionId,
    /// Transcript length at turn start; rollback returns this so the
    /// caller can truncate the conversation to match the restored files.
    pub message_index: u64,
    pub snapshots: Vec<FileSnapshot>,
}

impl Checkpoint {
    fn has_snapshot(&self, path: &Path) -> bool {
        self.snapshots.iter().any(|snapshot| snapshot.path == path)
    }
}

/// Manages the single active file checkpoint per session, persisted to
/// `<state_dir>/checkpoints/<session>.json` immediately on every change so
/// a crashed process can still restore.
///
/// Deliberately single-latest: unlike the message-indexed undo log, file
/// pre-images are only retained for the most recent uncommitted turn.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    active: Mutex<HashMap<SessionId, Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: state_dir.into().join("checkpoints"),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn checkpoint_path(&self, session: SessionId) -> PathBuf {
        self.checkpoint_dir.join(format!("{session}.json"))
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.checkpoint_dir).await?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(self.checkpoint_path(checkpoint.session), json).await?;
        Ok(())
    }

    async fn remove_persisted(&self, session: SessionId) {
        if let Err(err) = tokio::fs::remove_file(self.checkpoint_path(session)).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!("failed to remove checkpoint file for {session}: {err}");
        }
    }

    /// Open a new checkpoint for `session`, replacing any prior one.
    pub async fn create(&self, session: SessionId, message_index: u64) -> Result<()> {
        let checkpoint = Checkpoint {
            session,
            message_index,
            snapshots: Vec::new(),
        };
        self.persist(&checkpoint).await?;
        self.active.lock().await.insert(session, checkpoint);
        Ok(())
    }

    /// Whether `session` currently has an open checkpoint.
    pub async fn is_active(&self, session: SessionId) -> bool {
        self.active.lock().await.contains_key(&session)
    }

    /// Capture the pre-mutation state of `path`, called immediately before
    /// any mutating filesystem operation. First-write-wins: a second write
    /// to the same path within the checkpoint's lifetime is a no-op, so
    /// the recorded "before" state is the state at turn start.
    pub async fn record_snapshot(&self, session: SessionId, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut active = self.active.lock().await;
        let Some(checkpoint) = active.get_mut(&session) else {
            // No open checkpoint; nothing to protect.
            return Ok(());
        };
        if checkpoint.has_snapshot(path) {
            return Ok(());
        }
        let snapshot = match tokio::fs::read_to_string(path).await {
            Ok(prior_content) => FileSnapshot {
                path: path.to_path_buf(),
                prior_content,
                existed: true,
            },
            Err(err) if err.kind() == ErrorKind::NotFound => FileSnapshot {
                path: path.to_path_buf(),
                prior_content: String::new(),
                existed: false,
            },
            Err(err) => return Err(err.into()),
        };
        checkpoint.snapshots.push(snapshot);
        self.persist(checkpoint).await
    }

    /// Restore every snapshot in the active checkpoint: rewrite files that
    /// existed, delete files created during the turn. Per-file failures
    /// are logged and skipped; one unrestorable file never blocks the
    /// rest. Returns the message index to truncate the transcript back to,
    /// or `None` when there is no active checkpoint (e.g. a second
    /// rollback for the same session).
    pub async fn rollback(&self, session: SessionId) -> Result<Option<u64>> {
        let Some(checkpoint) = self.take(session).await? else {
            return Ok(None);
        };
        for snapshot in checkpoint.snapshots.iter().rev() {
            let outcome = if snapshot.existed {
                tokio::fs::write(&snapshot.path, &snapshot.prior_content).await
            } else {
                match tokio::fs::remove_file(&snapshot.path).await {
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            };
            if let Err(err) = outcome {
                warn!(
                    "failed to restore {} during rollback: {err}",
                    snapshot.path.display()
                );
            }
        }
        self.remove_persisted(session).await;
        info!(
            "rolled back {} file(s) for session {session}",
            checkpoint.snapshots.len()
        );
        Ok(Some(checkpoint.message_index))
    }

    /// Discard the active checkpoint without touching any files; the
    /// turn's mutations are kept.
    pub async fn commit(&self, session: SessionId) -> Result<()> {
        if self.active.lock().await.remove(&session).is_some() {
            self.remove_persisted(session).await;
        }
        Ok(())
    }

    /// Remove the active checkpoint from memory, falling back to the
    /// persisted copy when this process never held it (crash recovery).
    async fn take(&self, session: SessionId) -> Result<Option<Checkpoint>> {
        if let Some(checkpoint) = self.active.lock().await.remove(&session) {
            return Ok(Some(checkpoint));
        }
        match tokio::fs::read_to_string(self.checkpoint_path(session)).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

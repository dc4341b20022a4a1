#![allow(clippy::expect_used, clippy::unwrap_used)]

use kiln_core::CheckpointManager;
use kiln_protocol::SessionId;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Fixture {
    _state: TempDir,
    work: TempDir,
    manager: CheckpointManager,
    session: SessionId,
}

impl Fixture {
    fn new() -> Self {
        let state = TempDir::new().expect("state dir");
        let work = TempDir::new().expect("work dir");
        let manager = CheckpointManager::new(state.path());
        Self {
            _state: state,
            work,
            manager,
            session: SessionId::new(),
        }
    }

    fn file(&self, name: &str) -> std::path::PathBuf {
        self.work.path().join(name)
    }
}

#[tokio::test]
async fn rollback_restores_edits_and_deletes_created_files() {
    let fx = Fixture::new();
    let existing = fx.file("in.txt");
    let created = fx.file("out.txt");
    tokio::fs::write(&existing, "original").await.expect("seed");

    fx.manager.create(fx.session, 4).await.expect("create");
    fx.manager
        .record_snapshot(fx.session, &existing)
        .await
        .expect("snapshot existing");
    tokio::fs::write(&existing, "mutated").await.expect("edit");
    fx.manager
        .record_snapshot(fx.session, &created)
        .await
        .expect("snapshot created");
    tokio::fs::write(&created, "new file").await.expect("create file");

    let index = fx.manager.rollback(fx.session).await.expect("rollback");
    assert_eq!(index, Some(4));
    let restored = tokio::fs::read_to_string(&existing).await.expect("read");
    assert_eq!(restored, "original");
    assert!(!created.exists());
}

#[tokio::test]
async fn second_rollback_is_a_clean_no_op() {
    let fx = Fixture::new();
    fx.manager.create(fx.session, 2).await.expect("create");
    assert_eq!(
        fx.manager.rollback(fx.session).await.expect("first"),
        Some(2)
    );
    assert_eq!(fx.manager.rollback(fx.session).await.expect("second"), None);
}

#[tokio::test]
async fn first_snapshot_wins_for_repeated_writes() {
    let fx = Fixture::new();
    let path = fx.file("config.toml");
    tokio::fs::write(&path, "v1").await.expect("seed");

    fx.manager.create(fx.session, 0).await.expect("create");
    fx.manager
        .record_snapshot(fx.session, &path)
        .await
        .expect("first snapshot");
    tokio::fs::write(&path, "v2").await.expect("first edit");
    // Second mutation of the same path: the snapshot must keep "v1".
    fx.manager
        .record_snapshot(fx.session, &path)
        .await
        .expect("second snapshot");
    tokio::fs::write(&path, "v3").await.expect("second edit");

    fx.manager.rollback(fx.session).await.expect("rollback");
    let restored = tokio::fs::read_to_string(&path).await.expect("read");
    assert_eq!(restored, "v1");
}

#[tokio::test]
async fn commit_keeps_mutations_and_closes_checkpoint() {
    let fx = Fixture::new();
    let path = fx.file("main.rs");
    tokio::fs::write(&path, "fn main() {}").await.expect("seed");

    fx.manager.create(fx.session, 1).await.expect("create");
    fx.manager
        .record_snapshot(fx.session, &path)
        .await
        .expect("snapshot");
    tokio::fs::write(&path, "fn main() { run(); }")
        .await
        .expect("edit");

    fx.manager.commit(fx.session).await.expect("commit");
    assert!(!fx.manager.is_active(fx.session).await);
    let kept = tokio::fs::read_to_string(&path).await.expect("read");
    assert_eq!(kept, "fn main() { run(); }");
    // Committed state is final: rollback has nothing to restore.
    assert_eq!(fx.manager.rollback(fx.session).await.expect("rollback"), None);
}

#[tokio::test]
async fn create_replaces_a_stale_checkpoint() {
    let fx = Fixture::new();
    let path = fx.file("notes.md");
    tokio::fs::write(&path, "old turn").await.expect("seed");

    fx.manager.create(fx.session, 1).await.expect("first create");
    fx.manager
        .record_snapshot(fx.session, &path)
        .await
        .expect("snapshot");
    tokio::fs::write(&path, "edited in turn one").await.expect("edit");

    // A new turn opens a fresh checkpoint; the old pre-images are gone.
    fx.manager.create(fx.session, 7).await.expect("second create");
    assert_eq!(
        fx.manager.rollback(fx.session).await.expect("rollback"),
        Some(7)
    );
    let content = tokio::fs::read_to_string(&path).await.expect("read");
    assert_eq!(content, "edited in turn one");
}

#[tokio::test]
async fn snapshot_without_active_checkpoint_is_ignored() {
    let fx = Fixture::new();
    let path = fx.file("stray.txt");
    fx.manager
        .record_snapshot(fx.session, &path)
        .await
        .expect("no-op snapshot");
    assert!(!fx.manager.is_active(fx.session).await);
}

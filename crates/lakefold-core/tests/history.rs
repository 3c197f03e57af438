//! Time travel, diff, rollback and vacuum over catalog tables.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::time::Duration;

use common::*;
use lakefold_core::{
    AsOf, CommitInfo, EngineError, RetentionCutoff, Session, UpsertRequest, WriteMode, WriteRequest,
};
use tempfile::TempDir;

/// Keeps commit timestamps apart so timestamp references are unambiguous.
fn tick() {
    std::thread::sleep(Duration::from_millis(15));
}

/// v1: ids 1, 2. v2: id 3 inserted by upsert.
async fn two_versions(session: &Session) -> TestResult {
    let target = table("people");
    session
        .write(WriteRequest::new(target.clone(), people(&[1, 2], &["a", "b"], &[1.0, 2.0]), WriteMode::Overwrite))
        .await?;
    tick();
    session
        .upsert(UpsertRequest::new(target, people(&[3], &["c"], &[3.0]), ["id"]))
        .await?;
    Ok(())
}

#[tokio::test]
async fn reads_resolve_versions_and_timestamps() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    two_versions(&session).await?;
    let target = table("people");

    let v1 = session.read_as_of(&target, &AsOf::Version(1)).await?;
    assert_eq!(ids(&v1).await, vec![1, 2]);

    let snapshots = session.list_snapshots(CATALOG).await?;
    assert_eq!(snapshots.len(), 2);
    let at_first = session
        .read_as_of(&target, &AsOf::Timestamp(snapshots[0].created_at))
        .await?;
    assert_eq!(ids(&at_first).await, vec![1, 2]);
    let later = session
        .read_as_of(&target, &AsOf::Timestamp(snapshots[1].created_at + chrono::Duration::hours(1)))
        .await?;
    assert_eq!(ids(&later).await, vec![1, 2, 3]);

    for missing in [
        AsOf::Version(0),
        AsOf::Version(9),
        AsOf::Timestamp(snapshots[0].created_at - chrono::Duration::hours(1)),
    ] {
        let err = session.read_as_of(&target, &missing).await.expect_err("no snapshot");
        assert!(matches!(err, EngineError::SnapshotNotFound { .. }), "{missing}: {err}");
    }
    Ok(())
}

#[tokio::test]
async fn diff_is_symmetric() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    two_versions(&session).await?;
    let target = table("people");

    let forward = session
        .diff(&target, &AsOf::Version(1), Some(&AsOf::Version(2)), None)
        .await?;
    let backward = session
        .diff(&target, &AsOf::Version(2), Some(&AsOf::Version(1)), None)
        .await?;

    assert_eq!(int_values(&sorted_by_id(&forward.added), "id"), vec![3]);
    assert_eq!(forward.removed.num_rows(), 0);
    assert_eq!(sorted_by_id(&forward.added), sorted_by_id(&backward.removed));
    assert_eq!(sorted_by_id(&forward.removed), sorted_by_id(&backward.added));
    assert!(forward.modified.is_none());
    Ok(())
}

#[tokio::test]
async fn diff_with_keys_reports_modified_rows() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    let target = table("people");
    session
        .write(WriteRequest::new(target.clone(), people(&[1, 2], &["a", "b"], &[1.0, 2.0]), WriteMode::Overwrite))
        .await?;
    session
        .upsert(UpsertRequest::new(target.clone(), people(&[2, 3], &["B", "c"], &[2.0, 3.0]), ["id"]))
        .await?;

    let keys = vec!["id".to_string()];
    let diff = session
        .diff(&target, &AsOf::Version(1), None, Some(&keys))
        .await?;
    assert_eq!(int_values(&sorted_by_id(&diff.added), "id"), vec![2, 3]);
    assert_eq!(int_values(&diff.removed, "id"), vec![2]);

    let modified = diff.modified.expect("keys given");
    assert_eq!(string_values(&modified.before, "name"), vec![Some("b".to_string())]);
    assert_eq!(string_values(&modified.after, "name"), vec![Some("B".to_string())]);
    Ok(())
}

#[tokio::test]
async fn rollback_restores_contents_as_a_new_snapshot() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    two_versions(&session).await?;
    let target = table("people");

    let restored = session
        .rollback(&target, &AsOf::Version(1), CommitInfo::default())
        .await?;
    assert_eq!(restored.snapshot_id, 3);
    assert_eq!(restored.commit_message.as_deref(), Some("Rollback to 1"));

    let diff = session.diff(&target, &AsOf::Version(1), None, None).await?;
    assert_eq!(diff.added.num_rows(), 0);
    assert_eq!(diff.removed.num_rows(), 0);

    // History is kept: version 2 is still readable.
    let v2 = session.read_as_of(&target, &AsOf::Version(2)).await?;
    assert_eq!(ids(&v2).await, vec![1, 2, 3]);

    let custom = session
        .rollback(&target, &AsOf::Version(2), CommitInfo::message("undo the undo"))
        .await?;
    assert_eq!(custom.commit_message.as_deref(), Some("undo the undo"));
    assert_eq!(ids(&session.read(&target.into()).await?).await, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn rollback_recreates_a_dropped_table_state() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    let target = table("events");
    session
        .write(
            WriteRequest::new(target.clone(), id_year(&[1, 2], &[2023, 2024]), WriteMode::Overwrite)
                .partition_by(["year"]),
        )
        .await?;
    session
        .write(WriteRequest::new(target.clone(), id_year(&[9], &[2030]), WriteMode::Overwrite))
        .await?;
    session
        .rollback(&target, &AsOf::Version(1), CommitInfo::default())
        .await?;

    let relation = session.read(&target.into()).await?;
    assert_eq!(relation.file_count(), 2);
    assert_eq!(ids(&relation).await, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn vacuum_dry_run_matches_live_run() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    let target = table("people");
    let root = tmp.path().join("catalog");

    session
        .write(WriteRequest::new(target.clone(), people(&[1, 2], &["a", "b"], &[1.0, 2.0]), WriteMode::Overwrite))
        .await?;
    tick();
    session
        .write(WriteRequest::new(target.clone(), people(&[3], &["c"], &[3.0]), WriteMode::Overwrite))
        .await?;
    tick();
    session
        .write(WriteRequest::new(target.clone(), people(&[4], &["d"], &[4.0]), WriteMode::Append))
        .await?;

    let snapshots = session.list_snapshots(CATALOG).await?;
    let cutoff = RetentionCutoff::Before(snapshots[2].created_at);

    let dry = session.vacuum(&cutoff, true).await?;
    assert!(dry.dry_run);
    assert_eq!(
        dry.expired.iter().map(|s| s.snapshot_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(dry.reclaimed_files.len(), 1);
    assert!(root.join(&dry.reclaimed_files[0]).exists());
    assert_eq!(session.list_snapshots(CATALOG).await?.len(), 3);

    let live = session.vacuum(&cutoff, false).await?;
    assert_eq!(live.expired, dry.expired);
    assert_eq!(live.reclaimed_files, dry.reclaimed_files);
    assert!(!root.join(&live.reclaimed_files[0]).exists());

    let remaining = session.list_snapshots(CATALOG).await?;
    assert_eq!(
        remaining.iter().map(|s| s.snapshot_id).collect::<Vec<_>>(),
        vec![3]
    );
    assert_eq!(ids(&session.read(&target.clone().into()).await?).await, vec![3, 4]);

    let err = session
        .read_as_of(&target, &AsOf::Version(1))
        .await
        .expect_err("vacuumed");
    assert!(matches!(err, EngineError::SnapshotNotFound { .. }));

    // New commits continue the sequence after a vacuum.
    let next = session
        .write(WriteRequest::new(target, people(&[5], &["e"], &[5.0]), WriteMode::Append))
        .await?;
    assert_eq!(next.snapshot.map(|s| s.snapshot_id), Some(4));
    Ok(())
}

#[tokio::test]
async fn vacuum_never_expires_the_latest_snapshot() -> TestResult {
    let tmp = TempDir::new()?;
    let session = catalog_session(&tmp);
    two_versions(&session).await?;

    let cutoff: RetentionCutoff = "0s".parse()?;
    let report = session.vacuum(&cutoff, false).await?;
    assert_eq!(report.expired.len(), 1);
    assert!(report.reclaimed_files.is_empty());

    let remaining = session.list_snapshots(CATALOG).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].snapshot_id, 2);
    assert_eq!(
        ids(&session.read(&table("people").into()).await?).await,
        vec![1, 2, 3]
    );
    Ok(())
}

#[tokio::test]
async fn history_needs_the_catalog_backend() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let err = session
        .vacuum(&RetentionCutoff::OlderThan(chrono::Duration::minutes(1)), true)
        .await
        .expect_err("folder session");
    assert!(matches!(err, EngineError::WrongBackendMode { .. }));
    Ok(())
}

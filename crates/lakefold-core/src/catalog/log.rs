//! Async helpers for persisting and reading the catalog log.
//!
//! This module owns all on-disk interactions with `_catalog_log/`:
//! - Tracking the `CURRENT` pointer and reading the "no file" case as
//!   version `0` (fresh catalog).
//! - Writing zero-padded commit files with optimistic concurrency control so
//!   each version is created exactly once.
//! - Checkpoints: a full [`CatalogState`] snapshot under `_checkpoints/` plus
//!   a `CHECKPOINT` pointer. Vacuum writes one at the oldest retained version
//!   so older commit files can be deleted.
//!
//! Deciding which actions to commit is left to the caller.

use std::path::{Path, PathBuf};

use chrono::Utc;
use snafu::{Backtrace, prelude::*};

use crate::{
    catalog::{
        CommitError, ConflictSnafu, CorruptStateSnafu, StorageSnafu,
        actions::{CatalogAction, Commit},
        state::CatalogState,
    },
    request::CommitInfo,
    storage::{self, StorageError, StorageLocation},
};

/// Reads and writes the commit log under a catalog root.
///
/// Layout:
///   <root>/_catalog_log/0000000001.json
///   <root>/_catalog_log/CURRENT
///   <root>/_catalog_log/CHECKPOINT
///   <root>/_catalog_log/_checkpoints/0000000001.json
#[derive(Debug, Clone)]
pub struct CatalogLog {
    location: StorageLocation,
}

impl CatalogLog {
    /// Name of the subdirectory containing the commit log.
    pub const LOG_DIR_NAME: &str = "_catalog_log";
    /// Name of the file that stores the current version pointer.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Name of the file that stores the active checkpoint version.
    pub const CHECKPOINT_FILE_NAME: &str = "CHECKPOINT";
    /// Subdirectory holding checkpoint payloads.
    pub const CHECKPOINT_DIR_NAME: &str = "_checkpoints";
    /// Number of digits used in zero-padded commit file names.
    pub const COMMIT_FILENAME_DIGITS: usize = 10;

    /// Create a log rooted at a catalog directory.
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }

    /// The catalog root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    fn current_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CURRENT_FILE_NAME)
    }

    fn checkpoint_pointer_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CHECKPOINT_FILE_NAME)
    }

    fn padded(version: u64) -> String {
        format!(
            "{:0width$}.json",
            version,
            width = Self::COMMIT_FILENAME_DIGITS
        )
    }

    fn commit_rel_path(version: u64) -> PathBuf {
        Self::log_rel_dir().join(Self::padded(version))
    }

    fn checkpoint_rel_path(version: u64) -> PathBuf {
        Self::log_rel_dir()
            .join(Self::CHECKPOINT_DIR_NAME)
            .join(Self::padded(version))
    }

    async fn read_pointer(&self, rel: &Path) -> Result<u64, CommitError> {
        let contents = match storage::read_to_string(&self.location, rel).await {
            Ok(s) => s,
            Err(err) if err.is_missing() => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        ensure!(
            !trimmed.is_empty(),
            CorruptStateSnafu {
                msg: format!("{} has empty content", rel.display()),
            }
        );
        trimmed
            .parse::<u64>()
            .map_err(|e| CommitError::CorruptState {
                msg: format!("{} has invalid content {trimmed:?}: {e}", rel.display()),
                backtrace: Backtrace::capture(),
            })
    }

    /// Load the CURRENT version pointer; a missing file means version 0.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        self.read_pointer(&Self::current_rel_path()).await
    }

    /// Load the active checkpoint version; 0 when no checkpoint exists.
    pub async fn load_checkpoint_version(&self) -> Result<u64, CommitError> {
        self.read_pointer(&Self::checkpoint_pointer_rel_path()).await
    }

    /// Oldest version whose state can still be reconstructed.
    pub async fn earliest_version(&self) -> Result<u64, CommitError> {
        Ok(self.load_checkpoint_version().await?.max(1))
    }

    /// Load a single commit by version.
    pub async fn load_commit(&self, version: u64) -> Result<Commit, CommitError> {
        let rel = Self::commit_rel_path(version);
        let json = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;

        let commit: Commit = serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;
        ensure!(
            commit.version == version,
            CorruptStateSnafu {
                msg: format!(
                    "commit file for version {version} records version {}",
                    commit.version
                ),
            }
        );
        Ok(commit)
    }

    /// Load every retained commit from the earliest available version up to CURRENT.
    pub async fn load_retained_commits(&self) -> Result<Vec<Commit>, CommitError> {
        let current = self.load_current_version().await?;
        if current == 0 {
            return Ok(Vec::new());
        }
        let mut commits = Vec::new();
        for version in self.earliest_version().await?..=current {
            commits.push(self.load_commit(version).await?);
        }
        Ok(commits)
    }

    /// Load a checkpoint payload.
    pub async fn load_checkpoint(&self, version: u64) -> Result<CatalogState, CommitError> {
        let rel = Self::checkpoint_rel_path(version);
        let json = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;
        let state: CatalogState =
            serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
                msg: format!("failed to parse checkpoint {version}: {e}"),
                backtrace: Backtrace::capture(),
            })?;
        ensure!(
            state.version == version,
            CorruptStateSnafu {
                msg: format!(
                    "checkpoint file for version {version} records version {}",
                    state.version
                ),
            }
        );
        Ok(state)
    }

    /// Rebuild the catalog state as of `version` by replaying commits on top
    /// of the active checkpoint.
    pub async fn rebuild_state(&self, version: u64) -> Result<CatalogState, CommitError> {
        let checkpoint = self.load_checkpoint_version().await?;
        ensure!(
            version >= checkpoint,
            CorruptStateSnafu {
                msg: format!(
                    "version {version} predates the checkpoint at {checkpoint} and was vacuumed"
                ),
            }
        );

        let mut state = if checkpoint > 0 {
            self.load_checkpoint(checkpoint).await?
        } else {
            CatalogState::default()
        };
        for v in checkpoint + 1..=version {
            let commit = self.load_commit(v).await?;
            state.apply(&commit)?;
        }
        Ok(state)
    }

    /// Persist `state` as the active checkpoint.
    ///
    /// The payload is written before the pointer, so a crash in between
    /// leaves the previous checkpoint active.
    pub async fn write_checkpoint(&self, state: &CatalogState) -> Result<(), CommitError> {
        let json = serde_json::to_vec(state).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize checkpoint {}: {e}", state.version),
            backtrace: Backtrace::capture(),
        })?;
        storage::write_atomic(&self.location, &Self::checkpoint_rel_path(state.version), &json)
            .await
            .context(StorageSnafu)?;
        storage::write_atomic(
            &self.location,
            &Self::checkpoint_pointer_rel_path(),
            format!("{}\n", state.version).as_bytes(),
        )
        .await
        .context(StorageSnafu)?;
        Ok(())
    }

    /// Delete a commit file; a missing file is ignored.
    pub async fn remove_commit(&self, version: u64) -> Result<(), CommitError> {
        storage::remove_file_if_exists(&self.location, &Self::commit_rel_path(version))
            .await
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Delete a checkpoint payload; a missing file is ignored.
    pub async fn remove_checkpoint(&self, version: u64) -> Result<(), CommitError> {
        storage::remove_file_if_exists(&self.location, &Self::checkpoint_rel_path(version))
            .await
            .context(StorageSnafu)?;
        Ok(())
    }

    /// Commit a new version with an optimistic concurrency guard.
    ///
    /// ## Concurrency semantics
    ///
    /// The CURRENT check is advisory. The real guard is the create-new write
    /// of the commit file: if another writer creates the same version first
    /// this fails with `StorageError::Occupied`.
    ///
    /// ## Crash recovery
    ///
    /// If the commit file is created but updating CURRENT fails, the commit
    /// file is orphaned. Readers ignore it because they only look up to
    /// CURRENT, but the next writer for that version will see
    /// `Occupied` until the file is removed.
    ///
    /// ## Steps
    ///
    /// 1. Load CURRENT and return `Conflict` if it differs from `expected`.
    /// 2. Compute `expected + 1` with an overflow check.
    /// 3. Stamp the commit no earlier than the previous commit.
    /// 4. Create `_catalog_log/<zero-padded>.json` with create-new semantics.
    /// 5. Update `_catalog_log/CURRENT` (e.g. `"1\n"`).
    pub async fn commit_with_expected_version(
        &self,
        expected: u64,
        info: &CommitInfo,
        actions: Vec<CatalogAction>,
    ) -> Result<Commit, CommitError> {
        let current = self.load_current_version().await?;
        if current != expected {
            return ConflictSnafu {
                expected,
                found: current,
            }
            .fail();
        }

        let version = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;

        let mut timestamp = Utc::now();
        if expected > 0 {
            let previous = self.load_commit(expected).await?;
            timestamp = timestamp.max(previous.timestamp);
        }

        let commit = Commit {
            version,
            base_version: expected,
            timestamp,
            author: info.author.clone(),
            message: info.message.clone(),
            actions,
        };

        let json = serde_json::to_vec(&commit).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        storage::write_new(&self.location, &Self::commit_rel_path(version), &json)
            .await
            .context(StorageSnafu)?;

        storage::write_atomic(
            &self.location,
            &Self::current_rel_path(),
            format!("{version}\n").as_bytes(),
        )
        .await
        .context(StorageSnafu)?;

        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::actions::TableMeta,
        schema::LogicalSchema,
        target::TableRef,
    };
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log() -> (TempDir, CatalogLog) {
        let tmp = TempDir::new().expect("create temp dir");
        let log = CatalogLog::new(StorageLocation::local(tmp.path()));
        (tmp, log)
    }

    fn create_table_action(table: &str) -> CatalogAction {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        CatalogAction::CreateTable {
            table: TableRef {
                schema: "main".to_string(),
                table: table.to_string(),
            },
            meta: TableMeta {
                schema: LogicalSchema::from_arrow(&schema).expect("supported"),
                partition_by: None,
            },
        }
    }

    #[tokio::test]
    async fn fresh_log_reports_version_zero() -> TestResult {
        let (_tmp, log) = create_test_log();
        assert_eq!(log.load_current_version().await?, 0);
        assert_eq!(log.load_checkpoint_version().await?, 0);
        assert!(log.load_retained_commits().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn commits_advance_current_and_keep_metadata() -> TestResult {
        let (tmp, log) = create_test_log();
        let info = CommitInfo::message("first").with_author("ana");

        let first = log
            .commit_with_expected_version(0, &info, vec![create_table_action("a")])
            .await?;
        let second = log
            .commit_with_expected_version(1, &CommitInfo::default(), vec![create_table_action("b")])
            .await?;

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(log.load_current_version().await?, 2);

        let loaded = log.load_commit(1).await?;
        assert_eq!(loaded.author.as_deref(), Some("ana"));
        assert_eq!(loaded.message.as_deref(), Some("first"));

        let current = tokio::fs::read_to_string(
            tmp.path().join(CatalogLog::LOG_DIR_NAME).join("CURRENT"),
        )
        .await?;
        assert_eq!(current, "2\n");
        assert!(tmp
            .path()
            .join(CatalogLog::LOG_DIR_NAME)
            .join("0000000002.json")
            .exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_base_version_is_a_conflict() -> TestResult {
        let (_tmp, log) = create_test_log();
        log.commit_with_expected_version(0, &CommitInfo::default(), vec![])
            .await?;

        let err = log
            .commit_with_expected_version(0, &CommitInfo::default(), vec![])
            .await
            .expect_err("stale writer");
        assert!(matches!(
            err,
            CommitError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_current_is_reported() -> TestResult {
        let (tmp, log) = create_test_log();
        let dir = tmp.path().join(CatalogLog::LOG_DIR_NAME);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("CURRENT"), "not-a-number").await?;

        let err = log.load_current_version().await.expect_err("corrupt");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_replaces_replay_prefix() -> TestResult {
        let (_tmp, log) = create_test_log();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            log.commit_with_expected_version(i as u64, &CommitInfo::default(), vec![
                create_table_action(name),
            ])
            .await?;
        }

        let at_two = log.rebuild_state(2).await?;
        log.write_checkpoint(&at_two).await?;
        log.remove_commit(1).await?;

        assert_eq!(log.earliest_version().await?, 2);
        let retained: Vec<u64> = log
            .load_retained_commits()
            .await?
            .iter()
            .map(|c| c.version)
            .collect();
        assert_eq!(retained, vec![2, 3]);

        let state = log.rebuild_state(3).await?;
        assert_eq!(state.version, 3);
        assert_eq!(state.tables.len(), 3);
        assert!(log.rebuild_state(1).await.is_err());
        Ok(())
    }
}

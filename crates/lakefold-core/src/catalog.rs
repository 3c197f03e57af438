//! Versioned catalog backend.
//!
//! A catalog is a directory holding an append-only commit log
//! (`_catalog_log/`) and the Parquet data files of its tables
//! (`data/<schema>/<table>/<uuid>.parquet`). Every committed write, upsert,
//! rollback or partitioning change appends exactly one commit, and each
//! commit is one [`Snapshot`]. Table contents as of any retained snapshot are
//! rebuilt by replaying commits on top of the latest checkpoint.
//!
//! Mutations go through a [`Transaction`], which buffers log actions and the
//! data files written so far; the log's optimistic version guard decides
//! whether the commit lands.

use std::path::PathBuf;

use snafu::{Backtrace, prelude::*};

use crate::{
    error::{EngineResult, SnapshotNotFoundSnafu, TransactionLogSnafu},
    relation::{Relation, RelationFile},
    request::Compression,
    storage::{StorageError, StorageLocation},
    target::TableRef,
};

mod actions;
mod log;
mod state;
mod transaction;
mod writer;

pub use actions::{CatalogAction, Commit, DataFileMeta, FileId, Snapshot, TableMeta};
pub use log::CatalogLog;
pub use state::{CatalogState, TableState};
pub(crate) use transaction::Transaction;

/// Errors that can occur while reading or committing to the catalog log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// The caller's expected version does not match the CURRENT pointer.
    #[snafu(display("Commit conflict: expected version {expected}, but CURRENT is {found}"))]
    Conflict {
        /// The version the caller expected to be current.
        expected: u64,
        /// The actual current version found.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log or CURRENT file.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log, a checkpoint or the replayed state is malformed.
    #[snafu(display("Corrupt catalog state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Directory under the catalog root holding table data files.
pub const DATA_DIR_NAME: &str = "data";

/// Handle to a catalog rooted at a directory.
#[derive(Debug, Clone)]
pub struct Catalog {
    name: String,
    log: CatalogLog,
    compression: Compression,
}

impl Catalog {
    /// Attach to the catalog at `root`. Nothing is created until the first commit.
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            name: name.into(),
            log: CatalogLog::new(StorageLocation::local(root)),
            compression,
        }
    }

    /// Name targets use to address this catalog.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Catalog root.
    pub fn location(&self) -> &StorageLocation {
        self.log.location()
    }

    /// The commit log.
    pub fn log(&self) -> &CatalogLog {
        &self.log
    }

    pub(crate) fn compression(&self) -> Compression {
        self.compression
    }

    /// Relative directory holding a table's data files.
    pub(crate) fn table_data_dir(table: &TableRef) -> String {
        format!("{DATA_DIR_NAME}/{}/{}", table.schema, table.table)
    }

    /// Latest committed version; 0 for a fresh catalog.
    pub async fn current_version(&self) -> EngineResult<u64> {
        self.log
            .load_current_version()
            .await
            .context(TransactionLogSnafu)
    }

    /// Every retained snapshot, ascending by id.
    pub async fn snapshots(&self) -> EngineResult<Vec<Snapshot>> {
        let commits = self
            .log
            .load_retained_commits()
            .await
            .context(TransactionLogSnafu)?;
        Ok(commits.iter().map(Snapshot::from).collect())
    }

    /// State as of the latest commit.
    pub async fn current_state(&self) -> EngineResult<CatalogState> {
        let current = self.current_version().await?;
        self.log
            .rebuild_state(current)
            .await
            .context(TransactionLogSnafu)
    }

    /// State as of a retained snapshot.
    pub async fn state_at(&self, version: u64) -> EngineResult<CatalogState> {
        let current = self.current_version().await?;
        let earliest = self
            .log
            .earliest_version()
            .await
            .context(TransactionLogSnafu)?;
        ensure!(
            current > 0 && (earliest..=current).contains(&version),
            SnapshotNotFoundSnafu {
                reference: format!("version {version}"),
            }
        );
        self.log
            .rebuild_state(version)
            .await
            .context(TransactionLogSnafu)
    }

    /// Current state of one table, if it exists.
    pub async fn table_state(&self, table: &TableRef) -> EngineResult<Option<TableState>> {
        Ok(self.current_state().await?.tables.remove(table))
    }

    /// Lazy relation over a table's files.
    pub(crate) fn relation_for(&self, table: &TableState) -> Relation {
        let files = table
            .files_in_order()
            .into_iter()
            .map(|f| RelationFile::new(PathBuf::from(&f.path), Some(f.row_count)))
            .collect();
        Relation::new(self.location().clone(), table.meta.schema.to_arrow(), files)
    }
}

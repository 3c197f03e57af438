//! All-or-nothing catalog mutations.
//!
//! A [`Transaction`] is opened against the version that is current when it
//! begins. Data files are written immediately but only become visible when
//! the buffered actions are committed as the next log entry. If the commit
//! fails, or the transaction is rolled back or dropped, every file it wrote is
//! removed again.

use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    catalog::{
        Catalog,
        actions::{CatalogAction, Commit, DataFileMeta, FileId},
        state::CatalogState,
    },
    error::{EngineResult, TransactionLogSnafu},
    parquet_io,
    partition::{self, PartitionKey, PartitionSpec},
    request::CommitInfo,
    storage,
    target::TableRef,
};

/// A pending commit.
pub(crate) struct Transaction<'a> {
    catalog: &'a Catalog,
    state: CatalogState,
    info: CommitInfo,
    actions: Vec<CatalogAction>,
    written: Vec<PathBuf>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Begin a transaction on top of the current version.
    pub(crate) async fn begin(catalog: &'a Catalog, info: CommitInfo) -> EngineResult<Self> {
        let state = catalog.current_state().await?;
        debug!(base_version = state.version, "began catalog transaction");
        Ok(Self {
            catalog,
            state,
            info,
            actions: Vec::new(),
            written: Vec::new(),
            finished: false,
        })
    }

    /// State the transaction builds on.
    pub(crate) fn state(&self) -> &CatalogState {
        &self.state
    }

    /// Buffer an action.
    pub(crate) fn push(&mut self, action: CatalogAction) {
        self.actions.push(action);
    }

    /// Write one data file for `table` and buffer its `AddFile` action.
    pub(crate) async fn add_data_file(
        &mut self,
        table: &TableRef,
        batch: &RecordBatch,
        partition: Option<PartitionKey>,
    ) -> EngineResult<DataFileMeta> {
        let file_id = FileId::random();
        let path = format!("{}/{file_id}.parquet", Catalog::table_data_dir(table));
        let rel = PathBuf::from(&path);

        // Track before writing so a partially written file is cleaned up too.
        self.written.push(rel.clone());
        let row_count = parquet_io::write_new_file(
            self.catalog.location(),
            &rel,
            batch,
            self.catalog.compression(),
        )
        .await?;

        let file = DataFileMeta {
            file_id,
            path,
            row_count,
            partition,
            seq: 0,
        };
        self.push(CatalogAction::AddFile {
            table: table.clone(),
            file: file.clone(),
        });
        Ok(file)
    }

    /// Write `batch` as one file per partition (or a single file when
    /// unpartitioned). Empty batches write nothing.
    pub(crate) async fn add_rows(
        &mut self,
        table: &TableRef,
        batch: &RecordBatch,
        partition_by: Option<&PartitionSpec>,
    ) -> EngineResult<Vec<DataFileMeta>> {
        if batch.num_rows() == 0 {
            return Ok(Vec::new());
        }

        let groups = match partition_by {
            None => vec![(None, batch.clone())],
            Some(spec) => partition::split_by_partition(batch, spec)?
                .into_iter()
                .map(|(key, part)| (Some(key), part))
                .collect(),
        };

        let mut files = Vec::with_capacity(groups.len());
        for (key, part) in groups {
            files.push(self.add_data_file(table, &part, key).await?);
        }
        Ok(files)
    }

    /// Append the buffered actions as the next log entry.
    ///
    /// A conflicting or failed commit removes the written files and returns
    /// the log error unchanged.
    pub(crate) async fn commit(mut self) -> EngineResult<Commit> {
        let actions = std::mem::take(&mut self.actions);
        let result = self
            .catalog
            .log()
            .commit_with_expected_version(self.state.version, &self.info, actions)
            .await;

        match result {
            Ok(commit) => {
                self.finished = true;
                info!(
                    version = commit.version,
                    files = self.written.len(),
                    "committed catalog snapshot"
                );
                Ok(commit)
            }
            Err(source) => {
                self.discard().await;
                Err(source).context(TransactionLogSnafu)
            }
        }
    }

    /// Abandon the transaction and remove the files it wrote.
    pub(crate) async fn rollback(mut self) {
        self.discard().await;
    }

    /// Commit if staging succeeded; otherwise roll back and return the
    /// staging error unchanged.
    pub(crate) async fn finish<T>(self, staged: EngineResult<T>) -> EngineResult<(Commit, T)> {
        match staged {
            Ok(value) => Ok((self.commit().await?, value)),
            Err(err) => {
                self.rollback().await;
                Err(err)
            }
        }
    }

    async fn discard(&mut self) {
        self.finished = true;
        for rel in self.written.drain(..) {
            if let Err(e) = storage::remove_file_if_exists(self.catalog.location(), &rel).await {
                warn!(path = %rel.display(), error = %e, "failed to remove uncommitted data file");
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for rel in &self.written {
            if let Err(e) = storage::remove_file_blocking(&self.catalog.location().join(rel)) {
                warn!(path = %rel.display(), error = %e, "failed to remove uncommitted data file");
            }
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("base_version", &self.state.version)
            .field("actions", &self.actions.len())
            .field("written", &self.written)
            .finish()
    }
}

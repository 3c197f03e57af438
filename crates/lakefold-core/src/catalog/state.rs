//! In-memory catalog state rebuilt from the commit log.
//!
//! [`CatalogState`] is what a reader sees at a given version: the set of
//! tables and, for each, its metadata and live data files. It is also the
//! checkpoint payload, so it must round-trip through JSON unchanged.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    catalog::{
        CommitError, CorruptStateSnafu,
        actions::{CatalogAction, Commit, DataFileMeta, FileId, TableMeta},
    },
    target::TableRef,
};

/// One table as of some version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    /// Declared schema and partitioning.
    pub meta: TableMeta,
    /// Live data files keyed by id.
    pub files: BTreeMap<FileId, DataFileMeta>,
    /// Write-order position the next added file receives.
    #[serde(default)]
    pub next_seq: u64,
}

impl TableState {
    /// Total rows across live files.
    pub fn row_count(&self) -> u64 {
        self.files.values().map(|f| f.row_count).sum()
    }

    /// Live files in the order the commits added them.
    pub fn files_in_order(&self) -> Vec<&DataFileMeta> {
        let mut files: Vec<&DataFileMeta> = self.files.values().collect();
        files.sort_by(|a, b| (a.seq, &a.file_id).cmp(&(b.seq, &b.file_id)));
        files
    }
}

/// Every table as of `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    /// Version this state reflects; 0 before the first commit.
    pub version: u64,
    /// Tables by qualified name.
    pub tables: BTreeMap<TableRef, TableState>,
}

impl CatalogState {
    /// Look up a table.
    pub fn table(&self, table: &TableRef) -> Option<&TableState> {
        self.tables.get(table)
    }

    /// Apply one commit on top of this state.
    ///
    /// Commits must be applied in order; any action that does not fit the
    /// current state means the log is corrupt.
    pub fn apply(&mut self, commit: &Commit) -> Result<(), CommitError> {
        ensure!(
            commit.version == self.version + 1,
            CorruptStateSnafu {
                msg: format!(
                    "commit {} applied on top of version {}",
                    commit.version, self.version
                ),
            }
        );

        for action in &commit.actions {
            match action {
                CatalogAction::CreateTable { table, meta } => {
                    ensure!(
                        !self.tables.contains_key(table),
                        CorruptStateSnafu {
                            msg: format!("commit {} creates existing table {table}", commit.version),
                        }
                    );
                    self.tables.insert(
                        table.clone(),
                        TableState {
                            meta: meta.clone(),
                            files: BTreeMap::new(),
                            next_seq: 0,
                        },
                    );
                }
                CatalogAction::DropTable { table } => {
                    ensure!(
                        self.tables.remove(table).is_some(),
                        CorruptStateSnafu {
                            msg: format!("commit {} drops unknown table {table}", commit.version),
                        }
                    );
                }
                CatalogAction::UpdateTableMeta { table, meta } => {
                    self.table_mut(commit.version, table)?.meta = meta.clone();
                }
                CatalogAction::AddFile { table, file } => {
                    let version = commit.version;
                    let state = self.table_mut(version, table)?;
                    ensure!(
                        !state.files.contains_key(&file.file_id),
                        CorruptStateSnafu {
                            msg: format!("commit {version} adds file {} twice", file.file_id),
                        }
                    );
                    let mut file = file.clone();
                    file.seq = state.next_seq;
                    state.next_seq += 1;
                    state.files.insert(file.file_id.clone(), file);
                }
                CatalogAction::RemoveFile { table, file_id } => {
                    let version = commit.version;
                    ensure!(
                        self.table_mut(version, table)?.files.remove(file_id).is_some(),
                        CorruptStateSnafu {
                            msg: format!("commit {version} removes unknown file {file_id}"),
                        }
                    );
                }
            }
        }

        self.version = commit.version;
        Ok(())
    }

    fn table_mut(&mut self, version: u64, table: &TableRef) -> Result<&mut TableState, CommitError> {
        self.tables.get_mut(table).context(CorruptStateSnafu {
            msg: format!("commit {version} references unknown table {table}"),
        })
    }

    /// Paths of every live data file, relative to the catalog root.
    pub fn referenced_paths(&self) -> BTreeSet<String> {
        self.tables
            .values()
            .flat_map(|t| t.files.values().map(|f| f.path.clone()))
            .collect()
    }
}

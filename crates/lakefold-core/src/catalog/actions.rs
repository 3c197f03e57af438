//! Catalog log actions and commit payloads.
//!
//! Each commit file stores a [`Commit`] whose ordered [`CatalogAction`]s
//! evolve the catalog: tables are created, dropped or re-described, and data
//! files are attached to or detached from tables. A commit is also the
//! catalog's unit of history, exposed to callers as a [`Snapshot`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    partition::{PartitionKey, PartitionSpec},
    schema::LogicalSchema,
    target::TableRef,
};

/// Engine-assigned identifier of a data file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    /// A fresh random identifier.
    pub fn random() -> Self {
        FileId(Uuid::new_v4().simple().to_string())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A data file attached to a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMeta {
    /// Identifier, unique within the catalog.
    pub file_id: FileId,
    /// Path relative to the catalog root, `/`-separated.
    pub path: String,
    /// Number of rows in the file.
    pub row_count: u64,
    /// Partition combination of every row in the file, when the table is partitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionKey>,
    /// Position in the table's write order. Assigned when the commit adding
    /// the file is replayed; the value written to the log is ignored.
    #[serde(default)]
    pub seq: u64,
}

/// Table-level metadata: declared columns and partitioning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Declared columns.
    pub schema: LogicalSchema,
    /// Partitioning applied to new data files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<PartitionSpec>,
}

/// An action recorded in a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogAction {
    /// Register a new table.
    CreateTable {
        /// Table being created.
        table: TableRef,
        /// Its metadata.
        meta: TableMeta,
    },

    /// Forget a table and every file attached to it.
    DropTable {
        /// Table being dropped.
        table: TableRef,
    },

    /// Replace a table's metadata.
    UpdateTableMeta {
        /// Table being updated.
        table: TableRef,
        /// Replacement metadata.
        meta: TableMeta,
    },

    /// Attach a data file to a table.
    AddFile {
        /// Owning table.
        table: TableRef,
        /// The file.
        file: DataFileMeta,
    },

    /// Detach a data file from a table.
    RemoveFile {
        /// Owning table.
        table: TableRef,
        /// File to detach.
        file_id: FileId,
    },
}

/// A single, immutable commit in the catalog log.
///
/// Commits are written to files such as `_catalog_log/0000000001.json`. The
/// version must match the file name; `base_version` records what the writer
/// believed was current when it prepared the commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    /// Version number of this commit, starting from 1.
    pub version: u64,
    /// Version the writer built on.
    pub base_version: u64,
    /// Commit time (RFC3339 UTC). Never earlier than the previous commit's.
    pub timestamp: DateTime<Utc>,
    /// Optional author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Optional message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Ordered actions applied by this commit.
    pub actions: Vec<CatalogAction>,
}

/// Caller-facing view of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonically increasing identifier (the commit version).
    pub snapshot_id: u64,
    /// Commit time.
    pub created_at: DateTime<Utc>,
    /// Optional author.
    pub commit_author: Option<String>,
    /// Optional message.
    pub commit_message: Option<String>,
}

impl From<&Commit> for Snapshot {
    fn from(commit: &Commit) -> Self {
        Snapshot {
            snapshot_id: commit.version,
            created_at: commit.timestamp,
            commit_author: commit.author.clone(),
            commit_message: commit.message.clone(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.snapshot_id, self.created_at.to_rfc3339())?;
        if let Some(author) = &self.commit_author {
            write!(f, " by {author}")?;
        }
        if let Some(message) = &self.commit_message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

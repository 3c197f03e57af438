//! Partition-aware write and history engine for small data lakes.
//!
//! Rows (Arrow [`RecordBatch`](arrow::record_batch::RecordBatch)es) are
//! committed to one of two backends through a caller-owned [`Session`]:
//!
//! - A folder backend of plain Parquet datasets laid out as
//!   `<base>/<section>/<dataset>/col=value/...` (`folder` module), with
//!   overwrite, create-if-missing, ignore, append and replace-partitions
//!   modes, plus optional per-dataset partition governance (`governance`).
//! - A versioned catalog backend (`catalog` module) whose JSON commit log
//!   turns every write, upsert, rollback and partitioning change into one
//!   snapshot, with time-travel reads, diffs, rollback and retention
//!   vacuuming on top (`history` module).
//!
//! Every request is validated by the pure planning step in `plan` before any
//! I/O happens; previews (`preview`) reuse the same plans to report what a
//! write or upsert would do.
//!
//! # Limitations
//!
//! Folder writes are not transactional. A failed overwrite can leave a mix
//! of old and new partitions, and a replace-partitions write that fails after
//! deleting its partitions leaves them absent until it is retried. The
//! ignore mode's existence check races with concurrent writers. Catalog
//! operations commit atomically, and their written files are removed when a
//! commit fails.
#![warn(missing_docs)]

pub mod catalog;
pub mod error;
pub mod folder;
pub mod governance;
pub mod history;
mod parquet_io;
pub mod partition;
pub mod plan;
pub mod preview;
pub mod relation;
pub mod request;
pub mod rowset;
pub mod schema;
pub mod scratch;
pub mod session;
pub mod storage;
pub mod target;

pub use catalog::{Catalog, Snapshot};
pub use error::{EngineError, EngineResult};
pub use history::{AsOf, RetentionCutoff, TableDiff, VacuumReport};
pub use partition::PartitionSpec;
pub use relation::Relation;
pub use request::{CommitInfo, Compression, FilenamePattern, UpsertRequest, WriteMode, WriteRequest};
pub use session::{BackendKind, Session, SessionConfig, UpsertOutcome, WriteLocation, WriteOutcome};
pub use target::{CatalogTarget, FolderTarget, WriteTarget};

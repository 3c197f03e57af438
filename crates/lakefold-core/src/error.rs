//! Error types for engine operations.
//!
//! Every public operation fails with exactly one [`EngineError`] describing
//! a single root cause. Validation variants are produced before any I/O is
//! attempted, so callers can retry without cleanup. The backend-execution
//! variants (`Storage`, `TransactionLog`, `Arrow`, `Parquet`) wrap the
//! underlying failure unchanged.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    catalog::CommitError, request::WriteMode, session::BackendKind, storage::StorageError,
};

/// Convenience alias for results returned by the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the write and history engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// The session has no backend attached.
    #[snafu(display("Cannot {operation}: session is not connected to a backend"))]
    NotConnected {
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The operation targets the other backend than the one attached.
    #[snafu(display(
        "Cannot {operation}: operation requires the {expected} backend but the session is attached to {actual}"
    ))]
    WrongBackendMode {
        /// Operation that was attempted.
        operation: &'static str,
        /// Backend the operation needs.
        expected: BackendKind,
        /// Backend the session is attached to.
        actual: BackendKind,
    },

    /// A section, dataset, schema or table name failed the character check.
    #[snafu(display("Invalid {kind} name {value:?}: {reason}"))]
    InvalidIdentifier {
        /// Which identifier was rejected (e.g. "dataset").
        kind: &'static str,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Partition or key columns are missing, duplicated, null or otherwise unusable.
    #[snafu(display("Schema validation failed: {reason}"))]
    SchemaValidation {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Incoming columns do not line up with the target table.
    #[snafu(display("Schema mismatch for {target}: {reason}"))]
    SchemaMismatch {
        /// Qualified name of the target table.
        target: String,
        /// Human-readable description of the mismatch.
        reason: String,
    },

    /// The supplied partition spec differs from the dataset's required spec.
    #[snafu(display(
        "Dataset {section}/{dataset} must be partitioned by [{required}] but the write supplied [{supplied}]"
    ))]
    PartitionGovernanceViolation {
        /// Section of the governed dataset.
        section: String,
        /// Name of the governed dataset.
        dataset: String,
        /// The spec the governance rule requires.
        required: String,
        /// The spec the caller supplied (empty when none).
        supplied: String,
    },

    /// A partition value cannot be encoded into (or decoded from) a folder segment.
    #[snafu(display("Invalid partition value for column {column}: {reason}"))]
    InvalidPartitionValue {
        /// Column (or folder segment) that carried the value.
        column: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The write mode is not available on the attached backend.
    #[snafu(display("Write mode {mode} is not supported by the {backend} backend"))]
    UnsupportedWriteMode {
        /// Requested write mode.
        mode: WriteMode,
        /// Backend the request targeted.
        backend: BackendKind,
    },

    /// The request combines options that are not allowed together.
    #[snafu(display("Invalid request: {reason}"))]
    InvalidRequest {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The target dataset or table does not exist.
    #[snafu(display("Target not found: {target}"))]
    TargetNotFound {
        /// Path or qualified name of the missing target.
        target: String,
    },

    /// A catalog target names a catalog other than the attached one.
    #[snafu(display("Unknown catalog {requested:?}; the session is attached to {attached:?}"))]
    UnknownCatalog {
        /// Catalog the target referenced.
        requested: String,
        /// Catalog the session is attached to.
        attached: String,
    },

    /// Strict upsert found more than one incoming row for some key.
    #[snafu(display(
        "Incoming rows contain {count} duplicated key(s); for example: {}",
        sample.join("; ")
    ))]
    DuplicateKey {
        /// Number of distinct keys that occur more than once.
        count: usize,
        /// A few of the offending keys, rendered as `col=value` lists.
        sample: Vec<String>,
    },

    /// Both a version and a timestamp were supplied.
    #[snafu(display("Specify either a version or a timestamp, not both"))]
    AmbiguousTimeTravelReference,

    /// Neither a version nor a timestamp was supplied where one is required.
    #[snafu(display("A version or a timestamp is required"))]
    MissingTimeTravelReference,

    /// The referenced snapshot does not exist or has been vacuumed.
    #[snafu(display("No snapshot matches {reference}"))]
    SnapshotNotFound {
        /// The version or timestamp that was requested.
        reference: String,
    },

    /// A session configuration document could not be parsed.
    #[snafu(display("Invalid configuration: {source}"))]
    InvalidConfig {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Filesystem failure.
    #[snafu(display("Storage operation failed: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Catalog log failure, including optimistic-concurrency conflicts.
    #[snafu(display("Catalog log operation failed: {source}"))]
    TransactionLog {
        /// Underlying commit error.
        source: CommitError,
    },

    /// Arrow compute or layout failure.
    #[snafu(display("Arrow operation failed: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Parquet encode/decode failure.
    #[snafu(display("Parquet operation failed: {source}"))]
    Parquet {
        /// Underlying Parquet error.
        source: ParquetError,
    },
}

impl EngineError {
    /// Whether this error wraps a failure of the underlying store rather than
    /// a rejected request.
    pub fn is_backend_execution(&self) -> bool {
        matches!(
            self,
            EngineError::Storage { .. }
                | EngineError::TransactionLog { .. }
                | EngineError::Arrow { .. }
                | EngineError::Parquet { .. }
        )
    }
}

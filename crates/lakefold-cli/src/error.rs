use std::path::PathBuf;

use arrow::error::ArrowError;
use lakefold_core::{EngineError, history::ParseRetentionError};
use parquet::errors::ParquetError;
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Failed to load config {}: {source}", path.display()))]
    LoadConfig { path: PathBuf, source: EngineError },

    #[snafu(display("Input file not found or not accessible: {}", path.display()))]
    OpenInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display(
        "Unsupported input {}: expected a .parquet or .csv file",
        path.display()
    ))]
    UnsupportedInput { path: PathBuf },

    #[snafu(display("Failed to read parquet input {}: {source}", path.display()))]
    ReadParquet {
        path: PathBuf,
        source: ParquetError,
    },

    #[snafu(display("Failed to read input {}: {source}", path.display()))]
    DecodeInput { path: PathBuf, source: ArrowError },

    #[snafu(display("Invalid target: {message}"))]
    InvalidTarget { message: String },

    #[snafu(display("Invalid --older-than: {source}"))]
    InvalidRetention { source: ParseRetentionError },

    #[snafu(display("Invalid timestamp '{input}': expected RFC3339, e.g. 2025-01-31T12:00:00Z"))]
    InvalidTimestamp {
        input: String,
        source: chrono::ParseError,
    },

    #[snafu(display("Failed to render rows: {source}"))]
    Render { source: ArrowError },

    #[snafu(context(false), display("{source}"))]
    Engine { source: EngineError },
}

impl CliError {
    /// A follow-up suggestion for errors users commonly run into.
    pub fn hint(&self) -> Option<&'static str> {
        let CliError::Engine { source } = self else {
            return None;
        };
        match source {
            EngineError::WrongBackendMode { .. } => {
                Some("use --folder with --dataset, or --catalog with --table")
            }
            EngineError::UnknownCatalog { .. } => {
                Some("pass the catalog's name with --catalog-name")
            }
            EngineError::PartitionGovernanceViolation { .. } => {
                Some("pass --partition-by with exactly the columns the rule lists, in order")
            }
            EngineError::InvalidRequest { .. } => {
                Some("append and replace-partitions writes to folders need --partition-by")
            }
            EngineError::DuplicateKey { .. } => {
                Some("deduplicate the input, or drop --strict to let duplicates through")
            }
            EngineError::SnapshotNotFound { .. } => {
                Some("run `lakefold snapshots` to list the retained snapshots")
            }
            EngineError::AmbiguousTimeTravelReference => Some("pass either --snapshot or --as-of"),
            EngineError::MissingTimeTravelReference => Some("pass --snapshot ID or --as-of TIME"),
            EngineError::TransactionLog { .. } => {
                Some("another writer may have committed first; retry the command")
            }
            _ => None,
        }
    }
}

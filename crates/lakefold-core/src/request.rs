//! Write and upsert requests, plus the options they carry.

use std::{fmt, str::FromStr};

use arrow::record_batch::RecordBatch;
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use uuid::Uuid;

use crate::{
    error::{EngineResult, InvalidRequestSnafu},
    target::{CatalogTarget, WriteTarget},
};

/// How a write treats data already present at the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace everything at the target.
    Overwrite,
    /// Add files next to the existing ones.
    Append,
    /// Do nothing when the target already exists (folder backend only).
    IgnoreIfExists,
    /// Replace only the partitions present in the incoming rows (folder backend only).
    ReplacePartitions,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
            WriteMode::IgnoreIfExists => "ignore",
            WriteMode::ReplacePartitions => "replace_partitions",
        };
        write!(f, "{name}")
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "overwrite" => Ok(WriteMode::Overwrite),
            "append" => Ok(WriteMode::Append),
            "ignore" | "ignore_if_exists" => Ok(WriteMode::IgnoreIfExists),
            "replace_partitions" => Ok(WriteMode::ReplacePartitions),
            other => Err(format!("unknown write mode {other:?}")),
        }
    }
}

/// Parquet codec used for data files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Snappy block compression.
    #[default]
    Snappy,
    /// Zstandard at its default level.
    Zstd,
    /// No compression.
    Uncompressed,
}

impl Compression {
    pub(crate) fn to_parquet(self) -> ParquetCompression {
        match self {
            Compression::Snappy => ParquetCompression::SNAPPY,
            Compression::Zstd => ParquetCompression::ZSTD(ZstdLevel::default()),
            Compression::Uncompressed => ParquetCompression::UNCOMPRESSED,
        }
    }
}

/// Optional author and message recorded with a catalog commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Who made the change.
    pub author: Option<String>,
    /// Why the change was made.
    pub message: Option<String>,
}

impl CommitInfo {
    /// Commit info with a message only.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            author: None,
            message: Some(message.into()),
        }
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// File name template for data files written to the folder backend.
///
/// `{i}` expands to the file's index within its partition and `{uuid}` to a
/// fresh random token. `.parquet` is appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilenamePattern(String);

impl FilenamePattern {
    /// `data_{i}`, used when the target directory starts out empty.
    pub fn indexed() -> Self {
        Self("data_{i}".to_string())
    }

    /// `data_{uuid}`, used when files land next to existing ones.
    pub fn unique() -> Self {
        Self("data_{uuid}".to_string())
    }

    /// A caller-supplied template. It must contain `{i}` or `{uuid}` and no
    /// path separators.
    pub fn new(template: impl Into<String>) -> EngineResult<Self> {
        let template = template.into();
        ensure!(
            template.contains("{i}") || template.contains("{uuid}"),
            InvalidRequestSnafu {
                reason: format!("filename pattern {template:?} must contain {{i}} or {{uuid}}"),
            }
        );
        ensure!(
            !template.contains('/') && !template.contains('\\'),
            InvalidRequestSnafu {
                reason: format!("filename pattern {template:?} must not contain path separators"),
            }
        );
        Ok(Self(template))
    }

    /// Whether every expansion yields a fresh name.
    pub fn is_unique(&self) -> bool {
        self.0.contains("{uuid}")
    }

    /// The raw template.
    pub fn template(&self) -> &str {
        &self.0
    }

    /// Expand the template for the `index`-th file of a partition.
    pub fn render(&self, index: usize) -> String {
        let mut name = self.0.replace("{i}", &index.to_string());
        if name.contains("{uuid}") {
            name = name.replace("{uuid}", &Uuid::new_v4().simple().to_string());
        }
        format!("{name}.parquet")
    }
}

/// A request to write rows to a target.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    /// Destination.
    pub target: WriteTarget,
    /// Incoming rows.
    pub rows: RecordBatch,
    /// Partition spec entries; `None` for no partitioning (or, on a catalog
    /// overwrite, to keep the table's existing partitioning).
    pub partition_by: Option<Vec<String>>,
    /// Write mode.
    pub mode: WriteMode,
    /// File name template for folder writes that add files.
    pub filename_pattern: Option<FilenamePattern>,
    /// Commit metadata for catalog writes.
    pub commit: CommitInfo,
}

impl WriteRequest {
    /// A request with no partitioning and empty commit info.
    pub fn new(target: impl Into<WriteTarget>, rows: RecordBatch, mode: WriteMode) -> Self {
        Self {
            target: target.into(),
            rows,
            partition_by: None,
            mode,
            filename_pattern: None,
            commit: CommitInfo::default(),
        }
    }

    /// Partition by the given entries.
    pub fn partition_by<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_by = Some(entries.into_iter().map(Into::into).collect());
        self
    }

    /// Use a custom file name template.
    pub fn filename_pattern(mut self, pattern: FilenamePattern) -> Self {
        self.filename_pattern = Some(pattern);
        self
    }

    /// Attach commit metadata.
    pub fn commit_info(mut self, commit: CommitInfo) -> Self {
        self.commit = commit;
        self
    }
}

/// A request to merge rows into a catalog table by key.
#[derive(Clone, Debug)]
pub struct UpsertRequest {
    /// Destination table.
    pub target: CatalogTarget,
    /// Incoming rows.
    pub rows: RecordBatch,
    /// Key columns.
    pub by: Vec<String>,
    /// Columns overwritten on matched rows. `None` means every non-key
    /// incoming column; `Some(vec![])` means insert-only.
    pub update_cols: Option<Vec<String>>,
    /// Reject incoming rows that repeat a key.
    pub strict: bool,
    /// Commit metadata.
    pub commit: CommitInfo,
}

impl UpsertRequest {
    /// A non-strict request updating every non-key column.
    pub fn new<I, S>(target: CatalogTarget, rows: RecordBatch, by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target,
            rows,
            by: by.into_iter().map(Into::into).collect(),
            update_cols: None,
            strict: false,
            commit: CommitInfo::default(),
        }
    }

    /// Restrict updates to these columns (empty for insert-only).
    pub fn update_cols<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_cols = Some(cols.into_iter().map(Into::into).collect());
        self
    }

    /// Enable or disable the duplicate-key check.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Attach commit metadata.
    pub fn commit_info(mut self, commit: CommitInfo) -> Self {
        self.commit = commit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_parses_cli_spellings() {
        assert_eq!("replace-partitions".parse(), Ok(WriteMode::ReplacePartitions));
        assert_eq!("IGNORE".parse(), Ok(WriteMode::IgnoreIfExists));
        assert!("upsert".parse::<WriteMode>().is_err());
    }

    #[test]
    fn filename_patterns_expand_tokens() {
        assert_eq!(FilenamePattern::indexed().render(3), "data_3.parquet");

        let unique = FilenamePattern::unique();
        assert!(unique.is_unique());
        assert_ne!(unique.render(0), unique.render(0));

        assert!(FilenamePattern::new("part").is_err());
        assert!(FilenamePattern::new("a/{uuid}").is_err());
        assert!(!FilenamePattern::new("part_{i}").expect("valid").is_unique());
    }
}

//! Point-in-time history over catalog tables.
//!
//! Snapshots are addressed by id or by timestamp ([`AsOf`]). On top of
//! snapshot resolution this module offers time-travel reads, rollback
//! (which adds a snapshot, never removes one), set-based diffs between two
//! snapshots and retention vacuuming.
//!
//! Vacuum expires the longest prefix of snapshots created strictly before the
//! cutoff, never the latest one. Dry runs and live runs share
//! [`expired_snapshots`] and the same reclaimable-file computation.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use arrow::{
    datatypes::{Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use chrono::{DateTime, Duration, Utc};
use snafu::prelude::*;
use tracing::{info, instrument};

use crate::{
    catalog::{Catalog, CatalogAction, Commit, DATA_DIR_NAME, Snapshot},
    error::{
        AmbiguousTimeTravelReferenceSnafu, EngineResult, MissingTimeTravelReferenceSnafu,
        SchemaValidationSnafu, SnapshotNotFoundSnafu, StorageSnafu, TargetNotFoundSnafu,
        TransactionLogSnafu,
    },
    relation::Relation,
    request::CommitInfo,
    rowset::{self, RowEncoder},
    storage,
    target::TableRef,
};

/// A snapshot reference: an id or a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsOf {
    /// Snapshot id.
    Version(u64),
    /// Latest snapshot created at or before this instant.
    Timestamp(DateTime<Utc>),
}

impl AsOf {
    /// Build a reference from optional parts; exactly one must be given.
    pub fn from_parts(version: Option<u64>, timestamp: Option<DateTime<Utc>>) -> EngineResult<Self> {
        match (version, timestamp) {
            (Some(_), Some(_)) => AmbiguousTimeTravelReferenceSnafu.fail(),
            (None, None) => MissingTimeTravelReferenceSnafu.fail(),
            (Some(v), None) => Ok(AsOf::Version(v)),
            (None, Some(ts)) => Ok(AsOf::Timestamp(ts)),
        }
    }

    fn value(&self) -> String {
        match self {
            AsOf::Version(v) => v.to_string(),
            AsOf::Timestamp(ts) => ts.to_rfc3339(),
        }
    }
}

impl fmt::Display for AsOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsOf::Version(v) => write!(f, "version {v}"),
            AsOf::Timestamp(ts) => write!(f, "timestamp {}", ts.to_rfc3339()),
        }
    }
}

/// Rows that changed between two snapshots.
#[derive(Debug, Clone)]
pub struct TableDiff {
    /// Distinct rows present in `to` but not in `from`.
    pub added: RecordBatch,
    /// Distinct rows present in `from` but not in `to`.
    pub removed: RecordBatch,
    /// Key-matched changes, when key columns were given.
    pub modified: Option<ModifiedRows>,
}

/// Rows whose key appears in both the added and the removed set.
#[derive(Debug, Clone)]
pub struct ModifiedRows {
    /// The removed versions of those rows.
    pub before: RecordBatch,
    /// The added versions of those rows.
    pub after: RecordBatch,
}

/// How far back vacuum keeps snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionCutoff {
    /// Expire snapshots created before this instant.
    Before(DateTime<Utc>),
    /// Expire snapshots older than this age.
    OlderThan(Duration),
}

impl RetentionCutoff {
    /// The absolute cutoff relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RetentionCutoff::Before(ts) => *ts,
            RetentionCutoff::OlderThan(age) => now - *age,
        }
    }
}

/// A retention string that is neither a duration nor a timestamp.
#[derive(Debug, Snafu)]
#[snafu(display(
    "Invalid retention {input:?}: expected an age such as 7d, 12h, 30m or 45s, or an RFC3339 timestamp"
))]
pub struct ParseRetentionError {
    input: String,
}

impl FromStr for RetentionCutoff {
    type Err = ParseRetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
            return Ok(RetentionCutoff::Before(ts.with_timezone(&Utc)));
        }

        let invalid = || ParseRetentionSnafu { input: s }.build();
        let (unit_at, _) = input.char_indices().last().ok_or_else(invalid)?;
        let (amount, unit) = input.split_at(unit_at);
        let amount: i64 = amount.parse().map_err(|_| invalid())?;
        if amount < 0 {
            return Err(invalid());
        }
        let age = match unit {
            "d" => Duration::try_days(amount),
            "h" => Duration::try_hours(amount),
            "m" => Duration::try_minutes(amount),
            "s" => Duration::try_seconds(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;
        Ok(RetentionCutoff::OlderThan(age))
    }
}

/// Outcome of a vacuum run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumReport {
    /// Absolute cutoff that was applied.
    pub cutoff: DateTime<Utc>,
    /// Whether storage was left untouched.
    pub dry_run: bool,
    /// Snapshots that expire (or expired).
    pub expired: Vec<Snapshot>,
    /// Data files no retained snapshot references, relative to the catalog root.
    pub reclaimed_files: Vec<PathBuf>,
}

/// The snapshots a vacuum with `cutoff` expires.
///
/// `snapshots` must be ascending by id. The result is the longest prefix
/// created strictly before `cutoff`, excluding the latest snapshot.
pub fn expired_snapshots(snapshots: &[Snapshot], cutoff: DateTime<Utc>) -> Vec<Snapshot> {
    let expirable = snapshots.len().saturating_sub(1);
    snapshots[..expirable]
        .iter()
        .take_while(|s| s.created_at < cutoff)
        .cloned()
        .collect()
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn nullable(schema: &Schema) -> SchemaRef {
    Arc::new(Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), f.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ))
}

impl Catalog {
    /// Resolve a reference to a retained snapshot id.
    pub async fn resolve(&self, as_of: &AsOf) -> EngineResult<u64> {
        match as_of {
            AsOf::Version(v) => {
                let current = self.current_version().await?;
                let earliest = self
                    .log()
                    .earliest_version()
                    .await
                    .context(TransactionLogSnafu)?;
                ensure!(
                    current > 0 && (earliest..=current).contains(v),
                    SnapshotNotFoundSnafu {
                        reference: as_of.to_string(),
                    }
                );
                Ok(*v)
            }
            AsOf::Timestamp(ts) => self
                .snapshots()
                .await?
                .iter()
                .rev()
                .find(|s| s.created_at <= *ts)
                .map(|s| s.snapshot_id)
                .context(SnapshotNotFoundSnafu {
                    reference: as_of.to_string(),
                }),
        }
    }

    /// Read-only relation over a table as of a snapshot.
    pub async fn read_table_at(&self, table: &TableRef, as_of: &AsOf) -> EngineResult<Relation> {
        let version = self.resolve(as_of).await?;
        let state = self.state_at(version).await?;
        let table_state = state.table(table).context(TargetNotFoundSnafu {
            target: format!("{table} at snapshot {version}"),
        })?;
        Ok(self.relation_for(table_state))
    }

    async fn batch_at(&self, table: &TableRef, version: u64) -> EngineResult<Option<RecordBatch>> {
        let state = self.state_at(version).await?;
        match state.table(table) {
            Some(t) => Ok(Some(self.relation_for(t).collect_batch().await?)),
            None => Ok(None),
        }
    }

    /// Set difference between a table at `from` and at `to` (default: current).
    ///
    /// A side where the table did not exist counts as empty. Columns common
    /// to both sides are compared in `to` order.
    pub async fn diff(
        &self,
        table: &TableRef,
        from: &AsOf,
        to: Option<&AsOf>,
        key_cols: Option<&[String]>,
    ) -> EngineResult<TableDiff> {
        let from_version = self.resolve(from).await?;
        let to_version = match to {
            Some(r) => self.resolve(r).await?,
            None => self.resolve(&AsOf::Version(self.current_version().await?)).await?,
        };

        let (from_batch, to_batch) = match (
            self.batch_at(table, from_version).await?,
            self.batch_at(table, to_version).await?,
        ) {
            (None, None) => {
                return TargetNotFoundSnafu {
                    target: format!("{table} at snapshots {from_version} and {to_version}"),
                }
                .fail();
            }
            (Some(f), Some(t)) => (f, t),
            (Some(f), None) => (f.clone(), RecordBatch::new_empty(f.schema())),
            (None, Some(t)) => (RecordBatch::new_empty(t.schema()), t),
        };

        let from_schema = from_batch.schema();
        let common: Vec<String> = to_batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|name| from_schema.field_with_name(name).is_ok())
            .collect();

        let to_rows = rowset::project(&to_batch, &common)?;
        let schema = nullable(&to_rows.schema());
        let target = table.to_string();
        let to_rows = rowset::conform(&to_rows, &schema, &target)?;
        let from_rows = rowset::conform(&rowset::project(&from_batch, &common)?, &schema, &target)?;

        let added = rowset::set_difference(&to_rows, &from_rows)?;
        let removed = rowset::set_difference(&from_rows, &to_rows)?;

        let modified = match key_cols {
            Some(keys) => {
                for key in keys {
                    ensure!(
                        common.contains(key),
                        SchemaValidationSnafu {
                            reason: format!("key column {key:?} is not present in both snapshots"),
                        }
                    );
                }
                let encoder = RowEncoder::new(&schema, keys)?;
                let added_keys = encoder.encode(&added)?;
                let removed_keys = encoder.encode(&removed)?;
                let added_set: HashSet<_> = added_keys.iter().collect();
                let removed_set: HashSet<_> = removed_keys.iter().collect();

                let before = rowset::filter(
                    &removed,
                    removed_keys.iter().map(|k| added_set.contains(&k)).collect(),
                )?;
                let after = rowset::filter(
                    &added,
                    added_keys.iter().map(|k| removed_set.contains(&k)).collect(),
                )?;
                Some(ModifiedRows { before, after })
            }
            None => None,
        };

        Ok(TableDiff {
            added,
            removed,
            modified,
        })
    }

    /// Restore a table to its contents at `to`, as a new snapshot.
    ///
    /// Without a message, the commit is described as `Rollback to <ref>`.
    pub async fn rollback(&self, table: &TableRef, to: &AsOf, info: CommitInfo) -> EngineResult<Commit> {
        let version = self.resolve(to).await?;
        let info = match info.message {
            Some(_) => info,
            None => CommitInfo {
                message: Some(format!("Rollback to {}", to.value())),
                ..info
            },
        };
        let commit = self.execute_restore(table, version, info).await?;
        info!(table = %table, restored = version, snapshot = commit.version, "rolled back table");
        Ok(commit)
    }

    /// Paths referenced by any snapshot from `floor` through CURRENT.
    async fn retained_paths(&self, floor: u64, current: u64) -> EngineResult<BTreeSet<String>> {
        if current == 0 {
            return Ok(BTreeSet::new());
        }
        let mut keep = self.state_at(floor).await?.referenced_paths();
        for version in floor + 1..=current {
            let commit = self.log().load_commit(version).await.context(TransactionLogSnafu)?;
            for action in commit.actions {
                if let CatalogAction::AddFile { file, .. } = action {
                    keep.insert(file.path);
                }
            }
        }
        Ok(keep)
    }

    /// Expire old snapshots and reclaim unreferenced data files.
    #[instrument(skip_all, fields(catalog = %self.name(), cutoff = %cutoff, dry_run = dry_run))]
    pub async fn vacuum(&self, cutoff: DateTime<Utc>, dry_run: bool) -> EngineResult<VacuumReport> {
        let snapshots = self.snapshots().await?;
        let expired = expired_snapshots(&snapshots, cutoff);
        let current = snapshots.last().map_or(0, |s| s.snapshot_id);
        let floor = match (expired.last(), snapshots.first()) {
            (Some(last), _) => last.snapshot_id + 1,
            (None, Some(first)) => first.snapshot_id,
            (None, None) => 0,
        };

        let keep = self.retained_paths(floor, current).await?;
        let reclaimed_files: Vec<PathBuf> =
            storage::list_files(self.location(), Path::new(DATA_DIR_NAME), "parquet")
                .await
                .context(StorageSnafu)?
                .into_iter()
                .filter(|p| !keep.contains(&slash_path(p)))
                .collect();

        let report = VacuumReport {
            cutoff,
            dry_run,
            expired,
            reclaimed_files,
        };
        if dry_run {
            return Ok(report);
        }

        if !report.expired.is_empty() {
            let previous = self
                .log()
                .load_checkpoint_version()
                .await
                .context(TransactionLogSnafu)?;
            let state = self.state_at(floor).await?;
            self.log()
                .write_checkpoint(&state)
                .await
                .context(TransactionLogSnafu)?;
            for snapshot in &report.expired {
                self.log()
                    .remove_commit(snapshot.snapshot_id)
                    .await
                    .context(TransactionLogSnafu)?;
            }
            if previous > 0 && previous != floor {
                self.log()
                    .remove_checkpoint(previous)
                    .await
                    .context(TransactionLogSnafu)?;
            }
        }
        for path in &report.reclaimed_files {
            storage::remove_file_if_exists(self.location(), path)
                .await
                .context(StorageSnafu)?;
        }

        info!(
            expired = report.expired.len(),
            reclaimed = report.reclaimed_files.len(),
            "vacuum complete"
        );
        Ok(report)
    }
}

//! Dry-run reports.
//!
//! Previews run the same planning step as real writes and then describe what
//! would happen instead of doing it: row and column counts on both sides, the
//! schema delta, partition combinations and, for upserts, how many rows would
//! be inserted or updated. Nothing is written.

use std::{collections::HashSet, fmt};

use arrow::{datatypes::Schema, record_batch::RecordBatch};

use crate::{
    error::EngineResult,
    partition::{PartitionKey, PartitionSpec},
    plan::{CatalogPlan, FolderAction, UpsertPlan, WritePlan},
    relation::Relation,
    request::WriteMode,
    rowset::{DuplicateKeys, RowEncoder},
    schema::{ColumnSchema, SchemaDelta},
    target::WriteTarget,
};

/// Size and shape of a row set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSetSummary {
    /// Number of rows.
    pub rows: u64,
    /// Columns in order.
    pub columns: Vec<ColumnSchema>,
}

impl RowSetSummary {
    pub(crate) fn of_batch(batch: &RecordBatch) -> Self {
        Self {
            rows: batch.num_rows() as u64,
            columns: ColumnSchema::list(&batch.schema()),
        }
    }

    pub(crate) async fn of_relation(relation: &Relation) -> EngineResult<Self> {
        Ok(Self {
            rows: relation.count_rows().await?,
            columns: ColumnSchema::list(&relation.schema()),
        })
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

impl fmt::Display for RowSetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rows x {} columns", self.rows, self.column_count())
    }
}

/// What a write would do.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePreview {
    /// Destination.
    pub target: WriteTarget,
    /// Requested mode.
    pub mode: WriteMode,
    /// The validated plan.
    pub plan: WritePlan,
    /// The incoming rows.
    pub incoming: RowSetSummary,
    /// The target as it exists now.
    pub existing: Option<RowSetSummary>,
    /// Differences between the existing and the incoming schema.
    pub schema_delta: Option<SchemaDelta>,
    /// Effective partitioning of the write.
    pub partition_by: Option<PartitionSpec>,
    /// Partition combinations present in the incoming rows.
    pub partitions: Vec<PartitionKey>,
    /// Of those, the ones that already exist on disk.
    pub existing_partitions: Vec<PartitionKey>,
    /// Partition folders a `ReplacePartitions` write would delete.
    pub partitions_to_replace: Vec<PartitionKey>,
}

impl WritePreview {
    /// Whether the write would leave the target untouched.
    pub fn is_noop(&self) -> bool {
        matches!(
            &self.plan,
            WritePlan::Folder(p) if p.action == FolderAction::Skip
        )
    }
}

fn write_columns(f: &mut fmt::Formatter<'_>, columns: &[ColumnSchema]) -> fmt::Result {
    for column in columns {
        writeln!(f, "    {column}")?;
    }
    Ok(())
}

fn write_keys(f: &mut fmt::Formatter<'_>, label: &str, keys: &[PartitionKey]) -> fmt::Result {
    if keys.is_empty() {
        return Ok(());
    }
    writeln!(f, "{label}:")?;
    for key in keys {
        writeln!(f, "    {key}")?;
    }
    Ok(())
}

fn write_delta(f: &mut fmt::Formatter<'_>, delta: &SchemaDelta) -> fmt::Result {
    if delta.is_empty() {
        return writeln!(f, "schema: unchanged");
    }
    if !delta.added.is_empty() {
        writeln!(f, "columns added: {}", delta.added.join(", "))?;
    }
    if !delta.removed.is_empty() {
        writeln!(f, "columns removed: {}", delta.removed.join(", "))?;
    }
    for change in &delta.type_changes {
        writeln!(
            f,
            "type change: {} {} -> {}",
            change.column, change.existing, change.incoming
        )?;
    }
    Ok(())
}

impl fmt::Display for WritePreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "target: {} ({})", self.target, self.mode)?;
        let action = match &self.plan {
            WritePlan::Folder(p) => match &p.action {
                FolderAction::Overwrite => "overwrite dataset",
                FolderAction::Create => "create dataset",
                FolderAction::Skip => "skip (dataset exists)",
                FolderAction::Append => "append files",
                FolderAction::ReplacePartitions { .. } => "replace partitions",
            },
            WritePlan::Catalog(CatalogPlan::CreateOrReplace {
                replaces_existing: true,
                ..
            }) => "replace table",
            WritePlan::Catalog(CatalogPlan::CreateOrReplace { .. }) => "create table",
            WritePlan::Catalog(CatalogPlan::Append { .. }) => "append to table",
        };
        writeln!(f, "action: {action}")?;
        writeln!(f, "incoming: {}", self.incoming)?;
        write_columns(f, &self.incoming.columns)?;
        match &self.existing {
            Some(existing) => {
                writeln!(f, "existing: {existing}")?;
                write_columns(f, &existing.columns)?;
            }
            None => writeln!(f, "existing: none")?,
        }
        if let Some(delta) = &self.schema_delta {
            write_delta(f, delta)?;
        }
        if let Some(spec) = &self.partition_by {
            writeln!(f, "partition by: {spec}")?;
        }
        write_keys(f, "partitions", &self.partitions)?;
        write_keys(f, "partitions already on disk", &self.existing_partitions)?;
        write_keys(f, "partitions to delete", &self.partitions_to_replace)
    }
}

/// What an upsert would do.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPreview {
    /// The validated plan.
    pub plan: UpsertPlan,
    /// The incoming rows.
    pub incoming: RowSetSummary,
    /// The target table as it exists now.
    pub existing: RowSetSummary,
    /// Differences between the table and the incoming schema.
    pub schema_delta: SchemaDelta,
    /// Incoming rows whose key is new.
    pub would_insert: u64,
    /// Table rows whose key matches an incoming row and whose columns would change.
    pub would_update: u64,
    /// Keys repeated in the incoming rows.
    pub duplicate_keys: DuplicateKeys,
}

impl fmt::Display for UpsertPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "target: {} (upsert)", self.plan.table)?;
        writeln!(f, "keys: {}", self.plan.by.join(", "))?;
        if self.plan.update_cols.is_empty() {
            writeln!(f, "update columns: none (insert only)")?;
        } else {
            writeln!(f, "update columns: {}", self.plan.update_cols.join(", "))?;
        }
        writeln!(f, "incoming: {}", self.incoming)?;
        writeln!(f, "existing: {}", self.existing)?;
        write_delta(f, &self.schema_delta)?;
        writeln!(f, "would insert: {}", self.would_insert)?;
        writeln!(f, "would update: {}", self.would_update)?;
        if !self.duplicate_keys.is_empty() {
            writeln!(
                f,
                "duplicate keys: {} (e.g. {})",
                self.duplicate_keys.count,
                self.duplicate_keys.sample.join("; ")
            )?;
        }
        Ok(())
    }
}

/// Count upsert effects with a key join between `incoming` and `existing`.
pub(crate) fn upsert_counts(
    plan: &UpsertPlan,
    table_schema: &Schema,
    incoming: &RecordBatch,
    existing: &RecordBatch,
) -> EngineResult<(u64, u64)> {
    let encoder = RowEncoder::new(table_schema, &plan.by)?;
    let incoming_keys = encoder.encode(incoming)?;
    let existing_keys = encoder.encode(existing)?;

    let incoming_set: HashSet<_> = incoming_keys.iter().collect();
    let existing_set: HashSet<_> = existing_keys.iter().collect();

    let would_insert = incoming_keys
        .iter()
        .filter(|k| !existing_set.contains(k))
        .count() as u64;
    let would_update = if plan.update_cols.is_empty() {
        0
    } else {
        existing_keys
            .iter()
            .filter(|k| incoming_set.contains(k))
            .count() as u64
    };
    Ok((would_insert, would_update))
}

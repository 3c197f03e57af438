//! Catalog write executors.
//!
//! Each executor opens one [`Transaction`], stages its actions and data
//! files, and commits exactly one snapshot. A failed stage rolls the
//! transaction back and returns the stage's error unchanged.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use arrow::{
    array::ArrayRef, compute::kernels::interleave::interleave, datatypes::SchemaRef,
    record_batch::RecordBatch,
};
use snafu::prelude::*;
use tracing::{debug, instrument};

use crate::{
    catalog::{
        Catalog, Transaction,
        actions::{CatalogAction, Commit, TableMeta},
    },
    error::{ArrowSnafu, EngineResult, TargetNotFoundSnafu},
    parquet_io,
    partition::PartitionSpec,
    plan::{CatalogPlan, UpsertPlan},
    request::CommitInfo,
    rowset::{self, RowEncoder},
    target::TableRef,
};

/// Row counts produced by an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl Catalog {
    /// Execute a create/overwrite or append plan.
    #[instrument(skip_all, fields(catalog = %self.name, table = %plan.table()))]
    pub(crate) async fn execute_write(
        &self,
        plan: &CatalogPlan,
        rows: &RecordBatch,
        info: CommitInfo,
    ) -> EngineResult<Commit> {
        let mut tx = Transaction::begin(self, info).await?;
        let staged = match plan {
            CatalogPlan::CreateOrReplace {
                table,
                schema,
                partition_by,
                ..
            } => {
                stage_create(
                    &mut tx,
                    table,
                    TableMeta {
                        schema: schema.clone(),
                        partition_by: partition_by.clone(),
                    },
                    rows,
                )
                .await
            }
            CatalogPlan::Append { table, .. } => stage_append(&mut tx, table, rows).await,
        };
        Ok(tx.finish(staged).await?.0)
    }

    /// Merge `rows` into a table by key.
    #[instrument(skip_all, fields(catalog = %self.name, table = %plan.table))]
    pub(crate) async fn execute_upsert(
        &self,
        plan: &UpsertPlan,
        rows: &RecordBatch,
        info: CommitInfo,
    ) -> EngineResult<(Commit, UpsertCounts)> {
        let mut tx = Transaction::begin(self, info).await?;
        let staged = self.stage_upsert(&mut tx, plan, rows).await;
        tx.finish(staged).await
    }

    /// Change the partitioning applied to a table's future writes.
    #[instrument(skip_all, fields(catalog = %self.name, table = %table))]
    pub(crate) async fn execute_set_partitioning(
        &self,
        table: &TableRef,
        partition_by: Option<PartitionSpec>,
        info: CommitInfo,
    ) -> EngineResult<Commit> {
        let mut tx = Transaction::begin(self, info).await?;
        let staged = stage_set_partitioning(&mut tx, table, partition_by);
        Ok(tx.finish(staged).await?.0)
    }

    /// Make a table's current contents equal to its contents at `version`.
    ///
    /// Data files of the past snapshot are re-referenced, not copied.
    #[instrument(skip_all, fields(catalog = %self.name, table = %table, version = version))]
    pub(crate) async fn execute_restore(
        &self,
        table: &TableRef,
        version: u64,
        info: CommitInfo,
    ) -> EngineResult<Commit> {
        let past = self.state_at(version).await?;
        let past_table = past.table(table).cloned().context(TargetNotFoundSnafu {
            target: format!("{table} at snapshot {version}"),
        })?;

        let mut tx = Transaction::begin(self, info).await?;
        if tx.state().table(table).is_some() {
            tx.push(CatalogAction::DropTable {
                table: table.clone(),
            });
        }
        tx.push(CatalogAction::CreateTable {
            table: table.clone(),
            meta: past_table.meta.clone(),
        });
        for file in past_table.files_in_order() {
            tx.push(CatalogAction::AddFile {
                table: table.clone(),
                file: file.clone(),
            });
        }
        Ok(tx.finish(Ok(())).await?.0)
    }

    async fn stage_upsert(
        &self,
        tx: &mut Transaction<'_>,
        plan: &UpsertPlan,
        rows: &RecordBatch,
    ) -> EngineResult<UpsertCounts> {
        let table = &plan.table;
        let current = tx.state().table(table).cloned().context(TargetNotFoundSnafu {
            target: table.to_string(),
        })?;
        let schema = current.meta.schema.to_arrow();
        let partition_by = current.meta.partition_by.clone();

        let target_name = table.to_string();
        rowset::check_conformable(rows.schema().as_ref(), &schema, &target_name)?;
        let incoming = rowset::conform(rows, &schema, &target_name)?;

        let encoder = RowEncoder::new(&schema, &plan.by)?;
        let incoming_keys = encoder.encode(&incoming)?;
        // key -> incoming row carrying the new values
        let mut sources = HashMap::new();
        for (i, key) in incoming_keys.iter().enumerate() {
            sources.insert(key, i);
        }

        let update_columns: HashSet<usize> = plan
            .update_cols
            .iter()
            .filter_map(|c| schema.index_of(c).ok())
            .collect();

        let mut matched_sources = HashSet::new();
        let mut counts = UpsertCounts::default();

        for file in current.files_in_order() {
            let existing = self.read_conformed(&file.path, &schema, &target_name).await?;
            let existing_keys = encoder.encode(&existing)?;

            let mut picks = Vec::with_capacity(existing.num_rows());
            let mut updated_here = 0u64;
            for (row, key) in existing_keys.iter().enumerate() {
                match sources.get(&key) {
                    Some(&src) => {
                        matched_sources.insert(src);
                        updated_here += 1;
                        picks.push((1, src));
                    }
                    None => picks.push((0, row)),
                }
            }

            if updated_here == 0 || update_columns.is_empty() {
                continue;
            }

            let columns = (0..schema.fields().len())
                .map(|j| {
                    if update_columns.contains(&j) {
                        interleave(
                            &[existing.column(j).as_ref(), incoming.column(j).as_ref()],
                            &picks,
                        )
                        .context(ArrowSnafu)
                    } else {
                        Ok(existing.column(j).clone())
                    }
                })
                .collect::<EngineResult<Vec<ArrayRef>>>()?;
            let rewritten = RecordBatch::try_new(schema.clone(), columns).context(ArrowSnafu)?;

            debug!(file = %file.file_id, rows = updated_here, "rewriting data file");
            tx.push(CatalogAction::RemoveFile {
                table: table.clone(),
                file_id: file.file_id.clone(),
            });
            tx.add_rows(table, &rewritten, partition_by.as_ref()).await?;
            counts.updated += updated_here;
        }

        let mask: Vec<bool> = incoming_keys
            .iter()
            .map(|key| {
                sources
                    .get(&key)
                    .is_none_or(|src| !matched_sources.contains(src))
            })
            .collect();
        let inserts = rowset::filter(&incoming, mask)?;
        counts.inserted = inserts.num_rows() as u64;
        tx.add_rows(table, &inserts, partition_by.as_ref()).await?;
        Ok(counts)
    }

    async fn read_conformed(
        &self,
        path: &str,
        schema: &SchemaRef,
        target: &str,
    ) -> EngineResult<RecordBatch> {
        let contents = parquet_io::read_file(self.location(), Path::new(path)).await?;
        let batch = rowset::concat(&contents.schema, &contents.batches)?;
        rowset::conform(&batch, schema, target)
    }
}

async fn stage_create(
    tx: &mut Transaction<'_>,
    table: &TableRef,
    meta: TableMeta,
    rows: &RecordBatch,
) -> EngineResult<()> {
    if tx.state().table(table).is_some() {
        tx.push(CatalogAction::DropTable {
            table: table.clone(),
        });
    }
    let schema = meta.schema.to_arrow();
    let partition_by = meta.partition_by.clone();
    tx.push(CatalogAction::CreateTable {
        table: table.clone(),
        meta,
    });

    let batch = rowset::conform(rows, &schema, &table.to_string())?;
    tx.add_rows(table, &batch, partition_by.as_ref()).await?;
    Ok(())
}

async fn stage_append(tx: &mut Transaction<'_>, table: &TableRef, rows: &RecordBatch) -> EngineResult<()> {
    let meta = tx
        .state()
        .table(table)
        .map(|t| t.meta.clone())
        .context(TargetNotFoundSnafu {
            target: table.to_string(),
        })?;
    let schema = meta.schema.to_arrow();
    let target_name = table.to_string();
    rowset::check_conformable(rows.schema().as_ref(), &schema, &target_name)?;

    let batch = rowset::conform(rows, &schema, &target_name)?;
    tx.add_rows(table, &batch, meta.partition_by.as_ref()).await?;
    Ok(())
}

fn stage_set_partitioning(
    tx: &mut Transaction<'_>,
    table: &TableRef,
    partition_by: Option<PartitionSpec>,
) -> EngineResult<()> {
    let mut meta = tx
        .state()
        .table(table)
        .map(|t| t.meta.clone())
        .context(TargetNotFoundSnafu {
            target: table.to_string(),
        })?;
    if let Some(spec) = &partition_by {
        spec.check_against(&meta.schema.to_arrow())?;
    }
    meta.partition_by = partition_by;
    tx.push(CatalogAction::UpdateTableMeta {
        table: table.clone(),
        meta,
    });
    Ok(())
}

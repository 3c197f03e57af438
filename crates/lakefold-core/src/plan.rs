//! Write-mode policy.
//!
//! [`plan_write`] and [`plan_upsert`] validate a request against the inspected
//! state of its target and decide what physical work has to happen. They
//! never touch storage, so a planning failure leaves nothing behind and the
//! caller can retry immediately. Writers and previews consume the same plan.

use arrow::{
    array::Array,
    datatypes::{Schema, SchemaRef},
};
use snafu::prelude::*;
use tracing::debug;

use crate::{
    error::{
        DuplicateKeySnafu, EngineError, EngineResult, InvalidRequestSnafu, SchemaValidationSnafu,
        TargetNotFoundSnafu, UnsupportedWriteModeSnafu,
    },
    governance::GovernanceRules,
    partition::{self, PartitionKey, PartitionSpec},
    request::{FilenamePattern, UpsertRequest, WriteMode, WriteRequest},
    rowset::{self, DuplicateKeys},
    schema::LogicalSchema,
    session::BackendKind,
    target::{FolderTarget, TableRef, WriteTarget},
};

/// What a target looks like before a write, as read from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetState {
    /// Whether the dataset directory or table exists.
    pub exists: bool,
    /// Existing schema, when it could be determined.
    pub schema: Option<SchemaRef>,
    /// Recorded partitioning (catalog tables only).
    pub partition_by: Option<PartitionSpec>,
}

impl TargetState {
    /// State of a target that does not exist yet.
    pub fn missing() -> Self {
        Self::default()
    }
}

/// A validated write, ready for the backend executor.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    /// Folder-backend work.
    Folder(FolderPlan),
    /// Catalog-backend work.
    Catalog(CatalogPlan),
}

impl WritePlan {
    /// Backend the plan runs against.
    pub fn backend(&self) -> BackendKind {
        match self {
            WritePlan::Folder(_) => BackendKind::Folder,
            WritePlan::Catalog(_) => BackendKind::Catalog,
        }
    }
}

/// Physical step for a folder write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderAction {
    /// Remove the dataset directory, then write the rows.
    Overwrite,
    /// The dataset is missing: write the rows.
    Create,
    /// The dataset exists and the mode is `IgnoreIfExists`: do nothing.
    Skip,
    /// Add uniquely named files next to the existing ones.
    Append,
    /// Delete exactly these partition folders, then add the rows.
    ReplacePartitions {
        /// Folders to delete, one per partition combination in the rows.
        replaced: Vec<PartitionKey>,
    },
}

/// A validated folder write.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderPlan {
    /// Destination dataset.
    pub target: FolderTarget,
    /// Partitioning of the written files.
    pub partition_by: Option<PartitionSpec>,
    /// Distinct partition combinations of the incoming rows, in order of
    /// first appearance.
    pub partitions: Vec<PartitionKey>,
    /// What to do.
    pub action: FolderAction,
    /// File name template for new files.
    pub filename_pattern: FilenamePattern,
}

/// A validated catalog write.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogPlan {
    /// Create the table, dropping any existing one first.
    CreateOrReplace {
        /// Destination table.
        table: TableRef,
        /// Declared schema, derived from the incoming rows.
        schema: LogicalSchema,
        /// Partitioning of the new table.
        partition_by: Option<PartitionSpec>,
        /// Whether `partition_by` was carried over from the existing table.
        inherited_partitioning: bool,
        /// Whether an existing table is dropped.
        replaces_existing: bool,
        /// Distinct partition combinations of the incoming rows.
        partitions: Vec<PartitionKey>,
    },
    /// Add rows to an existing table.
    Append {
        /// Destination table.
        table: TableRef,
        /// Distinct partition combinations of the incoming rows.
        partitions: Vec<PartitionKey>,
    },
}

impl CatalogPlan {
    /// Destination table.
    pub fn table(&self) -> &TableRef {
        match self {
            CatalogPlan::CreateOrReplace { table, .. } | CatalogPlan::Append { table, .. } => table,
        }
    }
}

/// A validated upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    /// Destination table.
    pub table: TableRef,
    /// Key columns.
    pub by: Vec<String>,
    /// Columns overwritten on matched rows; empty means insert-only.
    pub update_cols: Vec<String>,
    /// Keys repeated in the incoming rows.
    pub duplicates: DuplicateKeys,
}

impl UpsertPlan {
    /// Fail with `DuplicateKey` when any incoming key repeats.
    pub fn ensure_unique_keys(&self) -> EngineResult<()> {
        ensure!(
            self.duplicates.is_empty(),
            DuplicateKeySnafu {
                count: self.duplicates.count,
                sample: self.duplicates.sample.clone(),
            }
        );
        Ok(())
    }
}

/// Validate `request` and decide the physical work.
///
/// `state` describes the target as it exists now; `governance` applies to
/// folder targets only.
pub fn plan_write(
    request: &WriteRequest,
    state: &TargetState,
    governance: &GovernanceRules,
) -> EngineResult<WritePlan> {
    request.target.validate()?;
    let partition_by = request
        .partition_by
        .as_ref()
        .map(PartitionSpec::parse)
        .transpose()?;

    let plan = match &request.target {
        WriteTarget::Folder(target) => {
            WritePlan::Folder(plan_folder(request, target, partition_by, state, governance)?)
        }
        WriteTarget::Catalog(target) => {
            ensure!(
                request.filename_pattern.is_none(),
                InvalidRequestSnafu {
                    reason: "file names in a catalog are managed by the engine",
                }
            );
            WritePlan::Catalog(plan_catalog(request, target.table_ref(), partition_by, state)?)
        }
    };
    debug!(target = %request.target, mode = %request.mode, ?plan, "planned write");
    Ok(plan)
}

fn plan_folder(
    request: &WriteRequest,
    target: &FolderTarget,
    partition_by: Option<PartitionSpec>,
    state: &TargetState,
    governance: &GovernanceRules,
) -> EngineResult<FolderPlan> {
    let rows_schema = request.rows.schema();

    let partitions = match &partition_by {
        Some(spec) => {
            ensure!(
                spec.is_identity_only(),
                SchemaValidationSnafu {
                    reason: format!(
                        "partition transforms in [{spec}] are only supported by the catalog backend"
                    ),
                }
            );
            spec.check_against(&rows_schema)?;
            ensure!(
                rows_schema.fields().len() > spec.fields().len(),
                SchemaValidationSnafu {
                    reason: "at least one column besides the partition columns is required",
                }
            );
            partition::distinct_keys(&request.rows, spec)?
        }
        None => Vec::new(),
    };

    governance.check(&target.section, &target.dataset, partition_by.as_ref())?;

    let needs_spec = matches!(request.mode, WriteMode::Append | WriteMode::ReplacePartitions);
    ensure!(
        !needs_spec || partition_by.is_some(),
        InvalidRequestSnafu {
            reason: format!("{} writes to the folder backend require a partition spec", request.mode),
        }
    );

    let action = match request.mode {
        WriteMode::Overwrite => FolderAction::Overwrite,
        WriteMode::IgnoreIfExists if state.exists => FolderAction::Skip,
        WriteMode::IgnoreIfExists => FolderAction::Create,
        WriteMode::Append => FolderAction::Append,
        WriteMode::ReplacePartitions => FolderAction::ReplacePartitions {
            replaced: partitions.clone(),
        },
    };

    let filename_pattern = match (&request.filename_pattern, needs_spec) {
        (Some(pattern), true) => {
            ensure!(
                pattern.is_unique(),
                InvalidRequestSnafu {
                    reason: format!(
                        "{} writes need a filename pattern containing {{uuid}}, got {:?}",
                        request.mode,
                        pattern.template()
                    ),
                }
            );
            pattern.clone()
        }
        (Some(pattern), false) => pattern.clone(),
        (None, true) => FilenamePattern::unique(),
        (None, false) => FilenamePattern::indexed(),
    };

    Ok(FolderPlan {
        target: target.clone(),
        partition_by,
        partitions,
        action,
        filename_pattern,
    })
}

fn plan_catalog(
    request: &WriteRequest,
    table: TableRef,
    partition_by: Option<PartitionSpec>,
    state: &TargetState,
) -> EngineResult<CatalogPlan> {
    let rows = &request.rows;
    match request.mode {
        WriteMode::Overwrite => {
            let schema = LogicalSchema::from_arrow(rows.schema().as_ref()).map_err(|e| {
                EngineError::SchemaValidation {
                    reason: e.to_string(),
                }
            })?;

            let inherited_partitioning = partition_by.is_none() && state.partition_by.is_some();
            let partition_by = partition_by.or_else(|| state.partition_by.clone());
            let partitions = match &partition_by {
                Some(spec) => partition::distinct_keys(rows, spec)?,
                None => Vec::new(),
            };

            Ok(CatalogPlan::CreateOrReplace {
                table,
                schema,
                partition_by,
                inherited_partitioning,
                replaces_existing: state.exists,
                partitions,
            })
        }
        WriteMode::Append => {
            ensure!(
                state.exists,
                TargetNotFoundSnafu {
                    target: table.to_string(),
                }
            );
            ensure!(
                partition_by.is_none(),
                InvalidRequestSnafu {
                    reason: "append cannot change a table's partitioning; use set_partitioning",
                }
            );
            if let Some(existing) = &state.schema {
                rowset::check_conformable(rows.schema().as_ref(), existing, &table.to_string())?;
            }
            let partitions = match &state.partition_by {
                Some(spec) => {
                    let conformed = match &state.schema {
                        Some(existing) => rowset::conform(rows, existing, &table.to_string())?,
                        None => rows.clone(),
                    };
                    partition::distinct_keys(&conformed, spec)?
                }
                None => Vec::new(),
            };
            Ok(CatalogPlan::Append { table, partitions })
        }
        mode @ (WriteMode::IgnoreIfExists | WriteMode::ReplacePartitions) => {
            UnsupportedWriteModeSnafu {
                mode,
                backend: BackendKind::Catalog,
            }
            .fail()
        }
    }
}

/// Validate an upsert against the target table.
///
/// Duplicate incoming keys are recorded, not rejected; call
/// [`UpsertPlan::ensure_unique_keys`] for strict requests.
pub fn plan_upsert(request: &UpsertRequest, state: &TargetState) -> EngineResult<UpsertPlan> {
    request.target.validate()?;
    let table = request.target.table_ref();
    ensure!(
        state.exists,
        TargetNotFoundSnafu {
            target: table.to_string(),
        }
    );

    let rows = &request.rows;
    let incoming = rows.schema();
    check_key_columns(&request.by, &incoming, state.schema.as_deref())?;
    if let Some(existing) = &state.schema {
        rowset::check_conformable(&incoming, existing, &table.to_string())?;
    }

    let update_cols = match &request.update_cols {
        Some(cols) => {
            for col in cols {
                ensure!(
                    incoming.field_with_name(col).is_ok(),
                    SchemaValidationSnafu {
                        reason: format!("update column {col:?} is not present in the incoming rows"),
                    }
                );
                ensure!(
                    !request.by.contains(col),
                    SchemaValidationSnafu {
                        reason: format!("key column {col:?} cannot be updated"),
                    }
                );
            }
            cols.clone()
        }
        None => incoming
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|name| !request.by.contains(name))
            .collect(),
    };

    for key in &request.by {
        let nulls = rows
            .column_by_name(key)
            .map(|c| c.null_count())
            .unwrap_or_default();
        ensure!(
            nulls == 0,
            SchemaValidationSnafu {
                reason: format!("key column {key:?} contains {nulls} null value(s)"),
            }
        );
    }

    let duplicates = rowset::duplicate_keys(rows, &request.by)?;
    debug!(
        table = %table,
        keys = ?request.by,
        ?update_cols,
        duplicate_keys = duplicates.count,
        "planned upsert"
    );

    Ok(UpsertPlan {
        table,
        by: request.by.clone(),
        update_cols,
        duplicates,
    })
}

fn check_key_columns(by: &[String], incoming: &Schema, existing: Option<&Schema>) -> EngineResult<()> {
    ensure!(
        !by.is_empty(),
        SchemaValidationSnafu {
            reason: "upsert requires at least one key column",
        }
    );
    for (i, key) in by.iter().enumerate() {
        ensure!(
            !by[..i].contains(key),
            SchemaValidationSnafu {
                reason: format!("key column {key:?} is listed more than once"),
            }
        );
        ensure!(
            incoming.field_with_name(key).is_ok(),
            SchemaValidationSnafu {
                reason: format!("key column {key:?} is not present in the incoming rows"),
            }
        );
        if let Some(existing) = existing {
            ensure!(
                existing.field_with_name(key).is_ok(),
                SchemaValidationSnafu {
                    reason: format!("key column {key:?} is not present in the target table"),
                }
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CatalogTarget;
    use arrow::{
        array::{ArrayRef, Float64Array, Int64Array, StringArray},
        datatypes::{DataType, Field},
        record_batch::RecordBatch,
    };
    use std::sync::Arc;

    fn rows() -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef),
            ("year", Arc::new(Int64Array::from(vec![2023, 2023, 2024, 2024])) as ArrayRef),
            ("rate", Arc::new(Float64Array::from(vec![1.0, 1.5, 2.0, 2.0])) as ArrayRef),
        ])
        .expect("valid batch")
    }

    fn folder() -> FolderTarget {
        FolderTarget::new("sales", "orders").expect("valid target")
    }

    fn catalog() -> CatalogTarget {
        CatalogTarget::new("lake", "main", "orders").expect("valid target")
    }

    fn folder_plan(request: &WriteRequest, state: &TargetState) -> EngineResult<FolderPlan> {
        match plan_write(request, state, &GovernanceRules::new())? {
            WritePlan::Folder(plan) => Ok(plan),
            other => panic!("expected folder plan, got {other:?}"),
        }
    }

    #[test]
    fn governance_requires_exact_spec() {
        let rules = GovernanceRules::new().with_rule(
            "sales",
            "orders",
            PartitionSpec::parse(["year"]).expect("spec"),
        );
        let state = TargetState::missing();

        let ok = WriteRequest::new(folder(), rows(), WriteMode::Overwrite).partition_by(["year"]);
        assert!(plan_write(&ok, &state, &rules).is_ok());

        for request in [
            WriteRequest::new(folder(), rows(), WriteMode::Overwrite),
            WriteRequest::new(folder(), rows(), WriteMode::Overwrite).partition_by(["rate"]),
            WriteRequest::new(folder(), rows(), WriteMode::Overwrite).partition_by(["year", "rate"]),
        ] {
            let err = plan_write(&request, &state, &rules).expect_err("governed");
            assert!(matches!(err, EngineError::PartitionGovernanceViolation { .. }));
        }
    }

    #[test]
    fn append_and_replace_need_a_partition_spec() {
        let state = TargetState::missing();
        for mode in [WriteMode::Append, WriteMode::ReplacePartitions] {
            let err = folder_plan(&WriteRequest::new(folder(), rows(), mode), &state)
                .expect_err("spec required");
            assert!(matches!(err, EngineError::InvalidRequest { .. }));

            let plan = folder_plan(
                &WriteRequest::new(folder(), rows(), mode).partition_by(["year"]),
                &state,
            )
            .expect("valid");
            assert!(plan.filename_pattern.is_unique());
        }
    }

    #[test]
    fn replace_marks_only_incoming_partitions() {
        let incoming = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![5, 6, 7])) as ArrayRef),
            ("year", Arc::new(Int64Array::from(vec![2024, 2024, 2026])) as ArrayRef),
        ])
        .expect("valid batch");
        let request =
            WriteRequest::new(folder(), incoming, WriteMode::ReplacePartitions).partition_by(["year"]);

        let plan = folder_plan(&request, &TargetState::missing()).expect("valid");
        let FolderAction::ReplacePartitions { replaced } = plan.action else {
            panic!("expected replace plan");
        };
        let folders: Vec<String> = replaced.iter().map(ToString::to_string).collect();
        assert_eq!(folders, vec!["year=2024", "year=2026"]);
    }

    #[test]
    fn ignore_if_exists_depends_on_target_state() {
        let request = WriteRequest::new(folder(), rows(), WriteMode::IgnoreIfExists);
        let existing = TargetState {
            exists: true,
            ..TargetState::default()
        };
        assert_eq!(folder_plan(&request, &existing).expect("valid").action, FolderAction::Skip);
        assert_eq!(
            folder_plan(&request, &TargetState::missing()).expect("valid").action,
            FolderAction::Create
        );
    }

    #[test]
    fn folder_rejects_transforms_and_partition_only_rows() {
        let request = WriteRequest::new(folder(), rows(), WriteMode::Overwrite).partition_by(["year(id)"]);
        assert!(folder_plan(&request, &TargetState::missing()).is_err());

        let only_key = RecordBatch::try_from_iter(vec![(
            "year",
            Arc::new(Int64Array::from(vec![2024])) as ArrayRef,
        )])
        .expect("valid batch");
        let request = WriteRequest::new(folder(), only_key, WriteMode::Overwrite).partition_by(["year"]);
        let err = folder_plan(&request, &TargetState::missing()).expect_err("no data column");
        assert!(matches!(err, EngineError::SchemaValidation { .. }));
    }

    #[test]
    fn catalog_overwrite_keeps_existing_partitioning() {
        let spec = PartitionSpec::parse(["year"]).expect("spec");
        let state = TargetState {
            exists: true,
            schema: Some(rows().schema()),
            partition_by: Some(spec.clone()),
        };
        let request = WriteRequest::new(catalog(), rows(), WriteMode::Overwrite);

        let WritePlan::Catalog(CatalogPlan::CreateOrReplace {
            partition_by,
            inherited_partitioning,
            replaces_existing,
            partitions,
            ..
        }) = plan_write(&request, &state, &GovernanceRules::new()).expect("valid")
        else {
            panic!("expected create-or-replace plan");
        };
        assert_eq!(partition_by, Some(spec));
        assert!(inherited_partitioning);
        assert!(replaces_existing);
        assert_eq!(partitions.len(), 2);
    }

    #[test]
    fn catalog_rejects_folder_only_modes_and_partitioned_appends() {
        let state = TargetState {
            exists: true,
            schema: Some(rows().schema()),
            partition_by: None,
        };
        for mode in [WriteMode::IgnoreIfExists, WriteMode::ReplacePartitions] {
            let err = plan_write(&WriteRequest::new(catalog(), rows(), mode), &state, &GovernanceRules::new())
                .expect_err("unsupported");
            assert!(matches!(err, EngineError::UnsupportedWriteMode { .. }));
        }

        let append = WriteRequest::new(catalog(), rows(), WriteMode::Append).partition_by(["year"]);
        let err = plan_write(&append, &state, &GovernanceRules::new()).expect_err("no partitioning");
        assert!(matches!(err, EngineError::InvalidRequest { .. }));

        let missing = WriteRequest::new(catalog(), rows(), WriteMode::Append);
        let err = plan_write(&missing, &TargetState::missing(), &GovernanceRules::new())
            .expect_err("missing table");
        assert!(matches!(err, EngineError::TargetNotFound { .. }));
    }

    #[test]
    fn upsert_validation() {
        let table_schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let state = TargetState {
            exists: true,
            schema: Some(table_schema),
            partition_by: None,
        };
        let incoming = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![1, 1])) as ArrayRef),
            ("name", Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef),
        ])
        .expect("valid batch");

        let plan = plan_upsert(&UpsertRequest::new(catalog(), incoming.clone(), ["id"]), &state)
            .expect("valid");
        assert_eq!(plan.update_cols, vec!["name".to_string()]);
        assert_eq!(plan.duplicates.count, 1);
        assert!(matches!(
            plan.ensure_unique_keys(),
            Err(EngineError::DuplicateKey { count: 1, .. })
        ));

        let no_keys = UpsertRequest::new(catalog(), incoming.clone(), Vec::<String>::new());
        assert!(plan_upsert(&no_keys, &state).is_err());

        let key_update = UpsertRequest::new(catalog(), incoming.clone(), ["id"]).update_cols(["id"]);
        assert!(plan_upsert(&key_update, &state).is_err());

        let extra = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
            ("oops", Arc::new(StringArray::from(vec!["x"])) as ArrayRef),
        ])
        .expect("valid batch");
        let err = plan_upsert(&UpsertRequest::new(catalog(), extra, ["id"]), &state)
            .expect_err("extra column");
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));

        let null_key = RecordBatch::try_from_iter(vec![(
            "id",
            Arc::new(Int64Array::from(vec![Some(1), None])) as ArrayRef,
        )])
        .expect("valid batch");
        let err = plan_upsert(&UpsertRequest::new(catalog(), null_key, ["id"]), &state)
            .expect_err("null key");
        assert!(matches!(err, EngineError::SchemaValidation { .. }));
    }
}

//! Folder-partitioned dataset store.
//!
//! Datasets live at `<base>/<section>/<dataset>/`, with one directory level
//! per partition field (`year=2024/month=1/...`) and Parquet files at the
//! leaves. Partition column values are carried by the folder names only;
//! reads add them back as constant columns.
//!
//! Each file written here records the Arrow types of the partition columns
//! in its schema metadata, so reads restore them exactly. Datasets written
//! by other tools carry no such record: their partition types are inferred
//! from the folder values, so `02134` reads back as the integer 2134.
//!
//! Nothing here is transactional. `Overwrite` removes the dataset directory
//! before writing and `ReplacePartitions` removes the affected partition
//! folders before writing: a failure between the two steps leaves those
//! folders absent, and the error of the failed step is returned as is.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use arrow::{
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use snafu::prelude::*;
use tracing::{debug, info, instrument};

use crate::{
    error::{ArrowSnafu, EngineResult, SchemaValidationSnafu, StorageSnafu, TargetNotFoundSnafu},
    parquet_io,
    partition::{self, PartitionKey, PartitionSpec},
    plan::{FolderAction, FolderPlan, TargetState},
    relation::{ConstantValue, Relation, RelationFile},
    request::Compression,
    rowset,
    schema::ColumnSchema,
    storage::{self, StorageLocation},
    target::FolderTarget,
};

/// Schema metadata key holding the partition column types of a data file,
/// as a JSON list of `[column, arrow type]` pairs in spec order.
pub const PARTITION_TYPES_KEY: &str = "lakefold.partition_types";

/// What a folder write did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderWriteReport {
    /// Files created, relative to the base path.
    pub files_written: Vec<PathBuf>,
    /// Partition folders that existed and were deleted.
    pub partitions_replaced: Vec<PartitionKey>,
    /// The write was skipped because the dataset already existed.
    pub skipped: bool,
}

/// A folder backend rooted at a base path.
#[derive(Debug, Clone)]
pub struct FolderStore {
    location: StorageLocation,
    compression: Compression,
}

impl FolderStore {
    /// A store writing under `base`.
    pub fn new(base: impl Into<PathBuf>, compression: Compression) -> Self {
        Self {
            location: StorageLocation::local(base),
            compression,
        }
    }

    /// Base path.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Inspect a dataset for planning.
    pub async fn target_state(&self, target: &FolderTarget) -> EngineResult<TargetState> {
        let exists = storage::exists(&self.location, &target.rel_dir())
            .await
            .context(StorageSnafu)?;
        if !exists {
            return Ok(TargetState::missing());
        }
        let relation = self.relation(target).await?;
        let schema = (relation.file_count() > 0).then(|| relation.schema());
        Ok(TargetState {
            exists,
            schema,
            partition_by: None,
        })
    }

    /// Which of `keys` already have a folder in the dataset.
    pub async fn existing_partitions(
        &self,
        target: &FolderTarget,
        keys: &[PartitionKey],
    ) -> EngineResult<Vec<PartitionKey>> {
        let dir = target.rel_dir();
        let mut found = Vec::new();
        for key in keys {
            if storage::exists(&self.location, &dir.join(key.folder()))
                .await
                .context(StorageSnafu)?
            {
                found.push(key.clone());
            }
        }
        Ok(found)
    }

    /// Run a folder plan.
    #[instrument(skip_all, fields(target = %plan.target, action = ?plan.action))]
    pub async fn execute(&self, plan: &FolderPlan, rows: &RecordBatch) -> EngineResult<FolderWriteReport> {
        let dir = plan.target.rel_dir();
        let mut report = FolderWriteReport::default();

        match &plan.action {
            FolderAction::Skip => {
                info!("dataset already exists; write skipped");
                report.skipped = true;
                return Ok(report);
            }
            FolderAction::Overwrite => {
                let removed = storage::remove_dir_all_if_exists(&self.location, &dir)
                    .await
                    .context(StorageSnafu)?;
                debug!(removed, "cleared dataset directory");
            }
            FolderAction::Create | FolderAction::Append => {}
            FolderAction::ReplacePartitions { replaced } => {
                for key in replaced {
                    if storage::remove_dir_all_if_exists(&self.location, &dir.join(key.folder()))
                        .await
                        .context(StorageSnafu)?
                    {
                        debug!(partition = %key, "deleted partition folder");
                        report.partitions_replaced.push(key.clone());
                    }
                }
            }
        }

        let mut parts = split_for_files(rows, plan.partition_by.as_ref())?;
        if parts.is_empty() && matches!(plan.action, FolderAction::Overwrite | FolderAction::Create) {
            // Zero partitioned rows still leave a readable, empty dataset.
            if let Some(spec) = &plan.partition_by {
                parts.push((PathBuf::new(), without_partition_columns(rows, spec)?));
            }
        }

        for (folder, batch) in parts {
            let rel = dir.join(folder).join(plan.filename_pattern.render(0));
            parquet_io::write_new_file(&self.location, &rel, &batch, self.compression).await?;
            report.files_written.push(rel);
        }

        info!(
            files = report.files_written.len(),
            replaced = report.partitions_replaced.len(),
            "folder write complete"
        );
        Ok(report)
    }

    /// Lazy relation over every file of a dataset.
    pub async fn relation(&self, target: &FolderTarget) -> EngineResult<Relation> {
        target.validate()?;
        let dir = target.rel_dir();
        let exists = storage::exists(&self.location, &dir)
            .await
            .context(StorageSnafu)?;
        ensure!(
            exists,
            TargetNotFoundSnafu {
                target: target.to_string(),
            }
        );

        let paths = storage::list_files(&self.location, &dir, "parquet")
            .await
            .context(StorageSnafu)?;
        let file_schema = match paths.first() {
            Some(first) => Some(parquet_io::read_footer(&self.location, first).await?.0),
            None => None,
        };
        let recorded = file_schema
            .as_deref()
            .map(recorded_partition_types)
            .unwrap_or_default();

        // Raw partition values per file, columns in order of first appearance.
        let mut columns: Vec<String> = recorded.iter().map(|(c, _)| c.clone()).collect();
        let mut raw_values: Vec<Vec<(String, String)>> = Vec::with_capacity(paths.len());
        for path in &paths {
            let pairs = partition_pairs(path, &dir)?;
            for (column, _) in &pairs {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
            raw_values.push(pairs);
        }

        let recorded: HashMap<String, DataType> = recorded.into_iter().collect();
        let types: BTreeMap<&str, DataType> = columns
            .iter()
            .map(|column| {
                let data_type = match recorded.get(column) {
                    Some(data_type) => data_type.clone(),
                    None => infer_partition_type(
                        raw_values
                            .iter()
                            .flatten()
                            .filter(|(c, _)| c == column)
                            .map(|(_, v)| v.as_str()),
                    ),
                };
                (column.as_str(), data_type)
            })
            .collect();

        let mut fields: Vec<Field> = match &file_schema {
            Some(file_schema) => file_schema
                .fields()
                .iter()
                .filter(|f| !types.contains_key(f.name().as_str()))
                .map(|f| Field::new(f.name(), f.data_type().clone(), true))
                .collect(),
            None => Vec::new(),
        };
        fields.extend(
            columns
                .iter()
                .map(|c| Field::new(c, types[c.as_str()].clone(), true)),
        );
        let schema: SchemaRef = Arc::new(Schema::new(fields));

        let files = paths
            .into_iter()
            .zip(raw_values)
            .map(|(path, pairs)| {
                let constants = pairs
                    .into_iter()
                    .map(|(column, raw)| {
                        let value = parse_constant(&constant_type(&types[column.as_str()]), raw);
                        (column, value)
                    })
                    .collect();
                RelationFile::new(path, None).with_constants(constants)
            })
            .collect();

        Ok(Relation::new(self.location.clone(), schema, files))
    }

    /// Column schema of a dataset.
    pub async fn describe(&self, target: &FolderTarget) -> EngineResult<Vec<ColumnSchema>> {
        Ok(ColumnSchema::list(&self.relation(target).await?.schema()))
    }
}

/// Split rows into `(relative folder, rows without partition columns)`.
fn split_for_files(
    rows: &RecordBatch,
    partition_by: Option<&PartitionSpec>,
) -> EngineResult<Vec<(PathBuf, RecordBatch)>> {
    let Some(spec) = partition_by else {
        return Ok(vec![(PathBuf::new(), rows.clone())]);
    };

    partition::split_by_partition(rows, spec)?
        .into_iter()
        .map(|(key, part)| Ok((key.folder(), without_partition_columns(&part, spec)?)))
        .collect()
}

/// Drop the partition columns of `rows`, recording their types in the
/// schema metadata under [`PARTITION_TYPES_KEY`].
fn without_partition_columns(rows: &RecordBatch, spec: &PartitionSpec) -> EngineResult<RecordBatch> {
    let schema = rows.schema();
    let partition_columns = spec.columns();
    let kept: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| !partition_columns.contains(&name.as_str()))
        .collect();

    let recorded = partition_columns
        .iter()
        .filter_map(|c| schema.field_with_name(c).ok())
        .map(|f| (f.name().clone(), f.data_type().to_string()))
        .collect::<Vec<_>>();
    let encoded = serde_json::to_string(&recorded).map_err(|err| {
        SchemaValidationSnafu {
            reason: format!("cannot record partition column types: {err}"),
        }
        .build()
    })?;

    let projected = rowset::project(rows, &kept)?;
    let mut metadata = projected.schema().metadata().clone();
    metadata.insert(PARTITION_TYPES_KEY.to_string(), encoded);
    let tagged = Arc::new(projected.schema().as_ref().clone().with_metadata(metadata));
    projected.with_schema(tagged).context(ArrowSnafu)
}

/// Partition column types recorded in a data file's schema, in spec order.
///
/// Missing or unreadable records yield nothing.
fn recorded_partition_types(schema: &Schema) -> Vec<(String, DataType)> {
    let Some(raw) = schema.metadata().get(PARTITION_TYPES_KEY) else {
        return Vec::new();
    };
    let Ok(pairs) = serde_json::from_str::<Vec<(String, String)>>(raw) else {
        return Vec::new();
    };
    pairs
        .into_iter()
        .filter_map(|(column, data_type)| Some((column, DataType::from_str(&data_type).ok()?)))
        .collect()
}

/// Decode the `column=value` directories between `dataset_dir` and a file.
fn partition_pairs(file: &Path, dataset_dir: &Path) -> EngineResult<Vec<(String, String)>> {
    let Ok(inner) = file.strip_prefix(dataset_dir) else {
        return Ok(Vec::new());
    };
    let Some(parent) = inner.parent() else {
        return Ok(Vec::new());
    };
    parent
        .components()
        .filter_map(|c| match c {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .map(partition::decode)
        .collect()
}

fn infer_partition_type<'a>(values: impl Iterator<Item = &'a str> + Clone) -> DataType {
    if values.clone().all(|v| v.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if values.clone().all(|v| v.parse::<f64>().is_ok()) {
        DataType::Float64
    } else if values.clone().all(|v| v == "true" || v == "false") {
        DataType::Boolean
    } else {
        DataType::Utf8
    }
}

/// The constant representation a folder value of `data_type` is parsed into;
/// reads cast it on to the column type.
fn constant_type(data_type: &DataType) -> DataType {
    if data_type.is_integer() {
        DataType::Int64
    } else if data_type.is_floating() {
        DataType::Float64
    } else if *data_type == DataType::Boolean {
        DataType::Boolean
    } else {
        DataType::Utf8
    }
}

fn parse_constant(data_type: &DataType, raw: String) -> ConstantValue {
    match data_type {
        DataType::Int64 => raw
            .parse()
            .map(ConstantValue::Int64)
            .unwrap_or(ConstantValue::Utf8(raw)),
        DataType::Float64 => raw
            .parse()
            .map(ConstantValue::Float64)
            .unwrap_or(ConstantValue::Utf8(raw)),
        DataType::Boolean => ConstantValue::Boolean(raw == "true"),
        _ => ConstantValue::Utf8(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_types_widen_in_order() {
        assert_eq!(infer_partition_type(["2023", "2024"].into_iter()), DataType::Int64);
        assert_eq!(infer_partition_type(["2024", "2.5"].into_iter()), DataType::Float64);
        assert_eq!(infer_partition_type(["true", "false"].into_iter()), DataType::Boolean);
        assert_eq!(infer_partition_type(["eu", "2024"].into_iter()), DataType::Utf8);
    }

    #[test]
    fn partition_types_are_recorded_per_file() {
        use arrow::array::{ArrayRef, Int32Array, StringArray};

        let rows = RecordBatch::try_from_iter(vec![
            ("zip", Arc::new(StringArray::from(vec!["02134"])) as ArrayRef),
            ("year", Arc::new(Int32Array::from(vec![2024])) as ArrayRef),
            ("amount", Arc::new(Int32Array::from(vec![5])) as ArrayRef),
        ])
        .expect("valid batch");
        let spec = PartitionSpec::parse(["zip", "year"]).expect("valid spec");

        let file = without_partition_columns(&rows, &spec).expect("projects");
        assert_eq!(file.num_columns(), 1);
        assert_eq!(
            recorded_partition_types(file.schema().as_ref()),
            vec![
                ("zip".to_string(), DataType::Utf8),
                ("year".to_string(), DataType::Int32),
            ]
        );
        assert!(recorded_partition_types(&Schema::empty()).is_empty());
    }

    #[test]
    fn constants_parse_through_their_family() {
        assert_eq!(constant_type(&DataType::Int32), DataType::Int64);
        assert_eq!(constant_type(&DataType::Float32), DataType::Float64);
        assert_eq!(constant_type(&DataType::Date32), DataType::Utf8);
        assert_eq!(
            parse_constant(&constant_type(&DataType::Utf8), "02134".to_string()),
            ConstantValue::Utf8("02134".to_string())
        );
    }

    #[test]
    fn folder_segments_become_pairs() {
        let pairs = partition_pairs(
            Path::new("sales/orders/year=2024/region=a%2Fb/data_0.parquet"),
            Path::new("sales/orders"),
        )
        .expect("decodes");
        assert_eq!(
            pairs,
            vec![
                ("year".to_string(), "2024".to_string()),
                ("region".to_string(), "a/b".to_string()),
            ]
        );
    }
}

//! Lazily evaluated, read-only relations.
//!
//! A [`Relation`] is a resolved list of Parquet files plus a target schema.
//! Nothing is decoded until [`Relation::collect`] is awaited. Folder-backend
//! relations also carry per-file constant columns recovered from partition
//! folder names, since those columns are not stored inside the files.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, new_null_array},
    compute::cast,
    datatypes::{DataType, SchemaRef},
    record_batch::{RecordBatch, RecordBatchOptions},
};
use snafu::prelude::*;

use crate::{
    error::{ArrowSnafu, EngineResult},
    parquet_io,
    rowset,
    storage::StorageLocation,
};

/// A value shared by every row of one file.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    /// 64-bit integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// Boolean.
    Boolean(bool),
    /// Text.
    Utf8(String),
}

impl ConstantValue {
    /// Arrow type of the value.
    pub fn data_type(&self) -> DataType {
        match self {
            ConstantValue::Int64(_) => DataType::Int64,
            ConstantValue::Float64(_) => DataType::Float64,
            ConstantValue::Boolean(_) => DataType::Boolean,
            ConstantValue::Utf8(_) => DataType::Utf8,
        }
    }

    fn to_array(&self, rows: usize) -> ArrayRef {
        match self {
            ConstantValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; rows])),
            ConstantValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; rows])),
            ConstantValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; rows])),
            ConstantValue::Utf8(v) => Arc::new(StringArray::from(vec![v.as_str(); rows])),
        }
    }
}

/// One file of a relation.
#[derive(Debug, Clone)]
pub(crate) struct RelationFile {
    path: PathBuf,
    row_count: Option<u64>,
    constants: Vec<(String, ConstantValue)>,
}

impl RelationFile {
    pub(crate) fn new(path: PathBuf, row_count: Option<u64>) -> Self {
        Self {
            path,
            row_count,
            constants: Vec::new(),
        }
    }

    pub(crate) fn with_constants(mut self, constants: Vec<(String, ConstantValue)>) -> Self {
        self.constants = constants;
        self
    }
}

/// A read-only view over a set of Parquet files.
#[derive(Debug, Clone)]
pub struct Relation {
    location: StorageLocation,
    schema: SchemaRef,
    files: Vec<RelationFile>,
}

impl Relation {
    pub(crate) fn new(location: StorageLocation, schema: SchemaRef, files: Vec<RelationFile>) -> Self {
        Self {
            location,
            schema,
            files,
        }
    }

    /// Column layout every collected batch has.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Number of files backing the relation.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// File paths relative to the backend root.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    /// Decode every file into batches conforming to [`Relation::schema`].
    pub async fn collect(&self) -> EngineResult<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for file in &self.files {
            let contents = parquet_io::read_file(&self.location, &file.path).await?;
            for batch in contents.batches {
                out.push(self.complete(&batch, file)?);
            }
        }
        Ok(out)
    }

    /// Decode every file into a single batch.
    pub async fn collect_batch(&self) -> EngineResult<RecordBatch> {
        let batches = self.collect().await?;
        rowset::concat(&self.schema, &batches)
    }

    /// Total row count, from recorded counts or Parquet footers.
    pub async fn count_rows(&self) -> EngineResult<u64> {
        let mut total = 0;
        for file in &self.files {
            total += match file.row_count {
                Some(rows) => rows,
                None => parquet_io::read_footer(&self.location, &file.path).await?.1,
            };
        }
        Ok(total)
    }

    fn complete(&self, batch: &RecordBatch, file: &RelationFile) -> EngineResult<RecordBatch> {
        let rows = batch.num_rows();
        let columns = self
            .schema
            .fields()
            .iter()
            .map(|field| {
                let source = match file.constants.iter().find(|(name, _)| name == field.name()) {
                    Some((_, value)) => Some(value.to_array(rows)),
                    None => batch.column_by_name(field.name()).cloned(),
                };
                match source {
                    Some(col) if col.data_type() == field.data_type() => Ok(col),
                    Some(col) => cast(&col, field.data_type()).context(ArrowSnafu),
                    None => Ok(new_null_array(field.data_type(), rows)),
                }
            })
            .collect::<EngineResult<Vec<ArrayRef>>>()?;

        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        RecordBatch::try_new_with_options(self.schema.clone(), columns, &options).context(ArrowSnafu)
    }
}

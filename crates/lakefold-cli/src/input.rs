//! Loading input rows from Parquet or CSV files.

use std::{fs::File, path::Path, sync::Arc};

use arrow::{
    compute::concat_batches,
    csv::{ReaderBuilder, reader::Format},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use snafu::prelude::*;
use tracing::debug;

use crate::error::{
    CliResult, DecodeInputSnafu, OpenInputSnafu, ReadParquetSnafu, UnsupportedInputSnafu,
};

/// Rows sampled when inferring a CSV schema.
const CSV_SCHEMA_SAMPLE: usize = 1_000;

/// Read a whole input file into one batch, choosing the format by extension.
pub fn read_rows(path: &Path) -> CliResult<RecordBatch> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let batch = match extension.as_deref() {
        Some("parquet") => read_parquet(path)?,
        Some("csv") => read_csv(path)?,
        _ => return UnsupportedInputSnafu { path }.fail(),
    };
    debug!(path = %path.display(), rows = batch.num_rows(), "loaded input");
    Ok(batch)
}

fn open(path: &Path) -> CliResult<File> {
    File::open(path).context(OpenInputSnafu { path })
}

fn read_parquet(path: &Path) -> CliResult<RecordBatch> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(open(path)?)
        .context(ReadParquetSnafu { path })?;
    let schema = builder.schema().clone();
    let batches = builder
        .build()
        .context(ReadParquetSnafu { path })?
        .collect::<Result<Vec<_>, _>>()
        .context(DecodeInputSnafu { path })?;
    concat_batches(&schema, &batches).context(DecodeInputSnafu { path })
}

fn read_csv(path: &Path) -> CliResult<RecordBatch> {
    let format = Format::default().with_header(true);
    let (schema, _) = format
        .infer_schema(open(path)?, Some(CSV_SCHEMA_SAMPLE))
        .context(DecodeInputSnafu { path })?;
    let schema = Arc::new(schema);
    let batches = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .build(open(path)?)
        .context(DecodeInputSnafu { path })?
        .collect::<Result<Vec<_>, _>>()
        .context(DecodeInputSnafu { path })?;
    concat_batches(&schema, &batches).context(DecodeInputSnafu { path })
}

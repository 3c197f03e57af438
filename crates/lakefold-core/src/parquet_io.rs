//! Parquet encode/decode helpers shared by both backends.
//!
//! Files are written whole with [`ArrowWriter`] into memory and handed to
//! [`storage::write_new`], so a data file name is only ever produced once.
//! Reads load the full file and decode it through
//! [`ParquetRecordBatchReaderBuilder`].

use std::path::Path;

use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use bytes::Bytes;
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::{
    error::{ArrowSnafu, EngineResult, ParquetSnafu, StorageSnafu},
    request::Compression,
    storage::{self, StorageLocation},
};

/// Encode one batch as a complete Parquet file.
pub(crate) fn encode_batch(batch: &RecordBatch, compression: Compression) -> EngineResult<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(compression.to_parquet())
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props)).context(ParquetSnafu)?;
    writer.write(batch).context(ParquetSnafu)?;
    writer.close().context(ParquetSnafu)?;
    Ok(buf)
}

/// Write `batch` to a new Parquet file; returns the number of rows written.
pub(crate) async fn write_new_file(
    location: &StorageLocation,
    rel_path: &Path,
    batch: &RecordBatch,
    compression: Compression,
) -> EngineResult<u64> {
    let bytes = encode_batch(batch, compression)?;
    storage::write_new(location, rel_path, &bytes)
        .await
        .context(StorageSnafu)?;
    Ok(batch.num_rows() as u64)
}

/// A decoded Parquet file.
#[derive(Debug, Clone)]
pub(crate) struct ParquetContents {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

/// Read and decode every row group of a Parquet file.
pub(crate) async fn read_file(
    location: &StorageLocation,
    rel_path: &Path,
) -> EngineResult<ParquetContents> {
    let bytes = storage::read_all_bytes(location, rel_path)
        .await
        .context(StorageSnafu)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes)).context(ParquetSnafu)?;
    let schema = builder.schema().clone();
    let reader = builder.build().context(ParquetSnafu)?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(ArrowSnafu)?;
    Ok(ParquetContents { schema, batches })
}

/// Schema and row count from a Parquet footer, without decoding pages.
pub(crate) async fn read_footer(
    location: &StorageLocation,
    rel_path: &Path,
) -> EngineResult<(SchemaRef, u64)> {
    let bytes = storage::read_all_bytes(location, rel_path)
        .await
        .context(StorageSnafu)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes)).context(ParquetSnafu)?;
    let rows = builder.metadata().file_metadata().num_rows().max(0) as u64;
    Ok((builder.schema().clone(), rows))
}

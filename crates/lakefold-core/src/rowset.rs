//! Row-set helpers over Arrow batches.
//!
//! Set semantics (diff, duplicate detection, key matching) go through the
//! Arrow row format: every row is encoded once into a comparable byte string
//! by a [`RowConverter`] and hashed from there.

use std::collections::{HashMap, HashSet};

use arrow::{
    array::{ArrayRef, BooleanArray, new_null_array},
    compute::{CastOptions, can_cast_types, cast_with_options, concat_batches, filter_record_batch},
    datatypes::{DataType, Schema, SchemaRef},
    record_batch::{RecordBatch, RecordBatchOptions},
    row::{RowConverter, Rows, SortField},
    util::display::{ArrayFormatter, FormatOptions},
};
use snafu::prelude::*;

use crate::error::{ArrowSnafu, EngineResult, SchemaMismatchSnafu, SchemaValidationSnafu};

/// Concatenate batches that share `schema`.
pub(crate) fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> EngineResult<RecordBatch> {
    concat_batches(schema, batches).context(ArrowSnafu)
}

/// Check that rows with schema `incoming` can be written into a table with
/// schema `table`: no extra columns, every missing column nullable, every
/// shared column castable to the table type.
pub(crate) fn check_conformable(incoming: &Schema, table: &Schema, target: &str) -> EngineResult<()> {
    let extra: Vec<&str> = incoming
        .fields()
        .iter()
        .filter(|f| table.field_with_name(f.name()).is_err())
        .map(|f| f.name().as_str())
        .collect();
    ensure!(
        extra.is_empty(),
        SchemaMismatchSnafu {
            target,
            reason: format!("incoming columns not in the table: {}", extra.join(", ")),
        }
    );

    for field in table.fields() {
        match incoming.field_with_name(field.name()) {
            Ok(source) => ensure!(
                can_cast_types(source.data_type(), field.data_type()),
                SchemaMismatchSnafu {
                    target,
                    reason: format!(
                        "column {} has type {} which cannot be cast to the table type {}",
                        field.name(),
                        source.data_type(),
                        field.data_type()
                    ),
                }
            ),
            Err(_) => ensure!(
                field.is_nullable(),
                SchemaMismatchSnafu {
                    target,
                    reason: format!("required column {} is missing", field.name()),
                }
            ),
        }
    }
    Ok(())
}

/// Cast `col` to `to`, failing on any value that does not convert.
///
/// Arrow's default cast turns such values into nulls.
fn cast_values(col: &ArrayRef, to: &DataType) -> Result<ArrayRef, arrow::error::ArrowError> {
    if col.data_type() == to {
        return Ok(col.clone());
    }
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    cast_with_options(col, to, &options)
}

/// Rebuild `batch` with exactly the columns of `schema`.
///
/// Shared columns are cast to the schema types, missing columns become
/// nulls, and columns not in `schema` are dropped. A value that cannot be
/// cast is a [`SchemaMismatch`](crate::error::EngineError::SchemaMismatch)
/// against `target`.
pub(crate) fn conform(batch: &RecordBatch, schema: &SchemaRef, target: &str) -> EngineResult<RecordBatch> {
    let rows = batch.num_rows();
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(col) => cast_values(col, field.data_type()).map_err(|err| {
                SchemaMismatchSnafu {
                    target,
                    reason: format!(
                        "column {} holds a value that cannot be cast from {} to {}: {err}",
                        field.name(),
                        col.data_type(),
                        field.data_type()
                    ),
                }
                .build()
            }),
            None => Ok(new_null_array(field.data_type(), rows)),
        })
        .collect::<EngineResult<Vec<ArrayRef>>>()?;

    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(schema.clone(), columns, &options).context(ArrowSnafu)
}

/// Keep only `columns`, in the given order.
pub(crate) fn project(batch: &RecordBatch, columns: &[String]) -> EngineResult<RecordBatch> {
    let schema = batch.schema();
    let indices = columns
        .iter()
        .map(|c| {
            schema.index_of(c).ok().context(SchemaValidationSnafu {
                reason: format!("column {c:?} is not present"),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    batch.project(&indices).context(ArrowSnafu)
}

/// Encodes a fixed list of columns into comparable rows.
///
/// One encoder must be used for every batch whose rows are compared, so all
/// of them share the same type layout.
pub(crate) struct RowEncoder {
    converter: RowConverter,
    columns: Vec<(String, DataType)>,
}

impl RowEncoder {
    /// Encoder for `columns` typed as in `schema`.
    pub(crate) fn new(schema: &Schema, columns: &[String]) -> EngineResult<Self> {
        let columns = columns
            .iter()
            .map(|c| {
                let field = schema.field_with_name(c).ok().context(SchemaValidationSnafu {
                    reason: format!("key column {c:?} is not present"),
                })?;
                Ok((c.clone(), field.data_type().clone()))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let converter = RowConverter::new(
            columns
                .iter()
                .map(|(_, dt)| SortField::new(dt.clone()))
                .collect(),
        )
        .context(ArrowSnafu)?;
        Ok(Self { converter, columns })
    }

    /// Encoder over every column of `schema`.
    pub(crate) fn all_columns(schema: &Schema) -> EngineResult<Self> {
        let names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
        Self::new(schema, &names)
    }

    /// Encode the encoder's columns of `batch`, casting where types differ.
    pub(crate) fn encode(&self, batch: &RecordBatch) -> EngineResult<Rows> {
        let arrays = self
            .columns
            .iter()
            .map(|(name, dt)| {
                let col = batch.column_by_name(name).context(SchemaValidationSnafu {
                    reason: format!("key column {name:?} is not present"),
                })?;
                cast_values(col, dt).map_err(|err| {
                    SchemaValidationSnafu {
                        reason: format!("key column {name:?} cannot be cast to {dt}: {err}"),
                    }
                    .build()
                })
            })
            .collect::<EngineResult<Vec<ArrayRef>>>()?;
        self.converter.convert_columns(&arrays).context(ArrowSnafu)
    }
}

/// Rows of `left` that do not occur in `right`, each distinct row once.
///
/// Both batches must carry the same columns.
pub(crate) fn set_difference(left: &RecordBatch, right: &RecordBatch) -> EngineResult<RecordBatch> {
    let encoder = RowEncoder::all_columns(left.schema().as_ref())?;
    let left_rows = encoder.encode(left)?;
    let right_rows = encoder.encode(right)?;

    let excluded: HashSet<_> = right_rows.iter().collect();
    let mut seen = HashSet::new();
    let mask: BooleanArray = left_rows
        .iter()
        .map(|row| Some(!excluded.contains(&row) && seen.insert(row)))
        .collect();

    filter_record_batch(left, &mask).context(ArrowSnafu)
}

/// Keep the rows of `batch` whose flag in `mask` is set.
pub(crate) fn filter(batch: &RecordBatch, mask: Vec<bool>) -> EngineResult<RecordBatch> {
    filter_record_batch(batch, &BooleanArray::from(mask)).context(ArrowSnafu)
}

/// Keys that occur more than once in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateKeys {
    /// Number of distinct keys with more than one row.
    pub count: usize,
    /// Up to [`DUPLICATE_SAMPLE_SIZE`] of those keys, rendered as `col=value` lists.
    pub sample: Vec<String>,
}

impl DuplicateKeys {
    /// Whether no key repeats.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Maximum number of duplicate keys reported in a sample.
pub const DUPLICATE_SAMPLE_SIZE: usize = 5;

/// Find keys that occur more than once in `batch`.
pub(crate) fn duplicate_keys(batch: &RecordBatch, keys: &[String]) -> EngineResult<DuplicateKeys> {
    let encoder = RowEncoder::new(batch.schema().as_ref(), keys)?;
    let rows = encoder.encode(batch)?;

    // key -> (first row, occurrences)
    let mut counts: HashMap<_, (usize, usize)> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        counts.entry(row).or_insert((i, 0)).1 += 1;
    }

    let mut repeated: Vec<usize> = counts
        .values()
        .filter(|(_, n)| *n > 1)
        .map(|(first, _)| *first)
        .collect();
    repeated.sort_unstable();

    let sample = repeated
        .iter()
        .take(DUPLICATE_SAMPLE_SIZE)
        .map(|row| render_key(batch, keys, *row))
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(DuplicateKeys {
        count: repeated.len(),
        sample,
    })
}

/// Render the key columns of one row as `col=value, col=value`.
pub(crate) fn render_key(batch: &RecordBatch, keys: &[String], row: usize) -> EngineResult<String> {
    let options = FormatOptions::default().with_null("null");
    let parts = keys
        .iter()
        .map(|k| {
            let col = batch.column_by_name(k).context(SchemaValidationSnafu {
                reason: format!("key column {k:?} is not present"),
            })?;
            let formatter = ArrayFormatter::try_new(col.as_ref(), &options).context(ArrowSnafu)?;
            Ok(format!("{k}={}", formatter.value(row)))
        })
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(parts.join(", "))
}

//! Partition specs and the folder-segment codec.
//!
//! A [`PartitionSpec`] is an ordered list of partition fields. On the folder
//! backend every field is a plain column and each distinct combination of
//! values becomes a directory chain `col=value/col=value/...` in spec order.
//! The catalog backend additionally accepts `year(col)`, `month(col)`,
//! `day(col)` and `hour(col)` transforms; there the encoded key is only
//! recorded in file metadata.
//!
//! Value formatting is fixed because folders written earlier must be found
//! again by later `ReplacePartitions` writes:
//!
//! - integers render without a decimal point (`year=2024`);
//! - floats with no fractional part render with exactly one decimal digit
//!   (`rate=2.0`), other floats use their shortest full decimal form
//!   (`rate=2.25`);
//! - strings are percent-escaped for `/`, `\`, `=`, `%` and control
//!   characters so [`encode`] and [`decode`] are inverse.
//!
//! Null and non-finite values cannot be partition keys.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
};

use arrow::{
    array::{Array, ArrayRef, AsArray, BooleanArray, UInt32Array},
    compute::{
        can_cast_types, cast,
        kernels::temporal::{DatePart, date_part},
        take_record_batch,
    },
    datatypes::{DataType, Float32Type, Float64Type, Int64Type, Schema, UInt64Type},
    record_batch::RecordBatch,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{
    ArrowSnafu, EngineError, EngineResult, InvalidPartitionValueSnafu, SchemaValidationSnafu,
};

/// How a partition field derives its value from a source column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionTransform {
    /// The column value itself.
    Identity,
    /// Calendar year of a date or timestamp.
    Year,
    /// Calendar month (1-12) of a date or timestamp.
    Month,
    /// Day of month of a date or timestamp.
    Day,
    /// Hour of day of a timestamp.
    Hour,
}

impl PartitionTransform {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "year" => Some(PartitionTransform::Year),
            "month" => Some(PartitionTransform::Month),
            "day" => Some(PartitionTransform::Day),
            "hour" => Some(PartitionTransform::Hour),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PartitionTransform::Identity => "identity",
            PartitionTransform::Year => "year",
            PartitionTransform::Month => "month",
            PartitionTransform::Day => "day",
            PartitionTransform::Hour => "hour",
        }
    }

    fn date_part(self) -> Option<DatePart> {
        match self {
            PartitionTransform::Identity => None,
            PartitionTransform::Year => Some(DatePart::Year),
            PartitionTransform::Month => Some(DatePart::Month),
            PartitionTransform::Day => Some(DatePart::Day),
            PartitionTransform::Hour => Some(DatePart::Hour),
        }
    }

    fn accepts(self, data_type: &DataType) -> bool {
        match self {
            PartitionTransform::Identity => true,
            PartitionTransform::Hour => matches!(data_type, DataType::Timestamp(..)),
            _ => matches!(
                data_type,
                DataType::Date32 | DataType::Date64 | DataType::Timestamp(..)
            ),
        }
    }
}

/// One entry of a partition spec.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionField {
    /// Source column the value is taken from.
    pub column: String,
    /// Transform applied to the column value.
    pub transform: PartitionTransform,
}

impl PartitionField {
    /// A field partitioning directly by `column`.
    pub fn identity(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            transform: PartitionTransform::Identity,
        }
    }

    /// Parse `col` or `transform(col)`.
    pub fn parse(expr: &str) -> EngineResult<Self> {
        let expr = expr.trim();
        ensure!(
            !expr.is_empty(),
            SchemaValidationSnafu {
                reason: "partition spec entries must not be empty",
            }
        );

        let Some((name, rest)) = expr.split_once('(') else {
            return Ok(Self::identity(expr));
        };

        let inner = rest
            .strip_suffix(')')
            .map(str::trim)
            .filter(|inner| !inner.is_empty())
            .context(SchemaValidationSnafu {
                reason: format!("malformed partition expression {expr:?}"),
            })?;
        let transform =
            PartitionTransform::parse(name.trim()).context(SchemaValidationSnafu {
                reason: format!("unknown partition transform {:?} in {expr:?}", name.trim()),
            })?;

        Ok(Self {
            column: inner.to_string(),
            transform,
        })
    }

    /// Whether this field uses the column value unchanged.
    pub fn is_identity(&self) -> bool {
        self.transform == PartitionTransform::Identity
    }

    /// Check the source column exists in `schema` with a type the transform accepts.
    pub fn check_against(&self, schema: &Schema) -> EngineResult<()> {
        let field = schema
            .field_with_name(&self.column)
            .ok()
            .context(SchemaValidationSnafu {
                reason: format!("partition column {:?} is not present in the rows", self.column),
            })?;
        ensure!(
            self.transform.accepts(field.data_type()),
            SchemaValidationSnafu {
                reason: format!(
                    "partition transform {} cannot be applied to column {} of type {}",
                    self.transform.name(),
                    self.column,
                    field.data_type()
                ),
            }
        );
        Ok(())
    }
}

impl fmt::Display for PartitionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transform {
            PartitionTransform::Identity => write!(f, "{}", self.column),
            other => write!(f, "{}({})", other.name(), self.column),
        }
    }
}

/// Ordered, non-empty list of partition fields.
///
/// Order is significant: it decides the folder nesting and governance
/// rules compare specs order-sensitively.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PartitionSpec {
    fields: Vec<PartitionField>,
}

impl PartitionSpec {
    /// Parse a spec from its textual entries.
    ///
    /// Fails with `SchemaValidation` when the list is empty, an entry is
    /// blank or malformed, or two entries are identical.
    pub fn parse<I, S>(entries: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = entries
            .into_iter()
            .map(|e| PartitionField::parse(e.as_ref()))
            .collect::<EngineResult<Vec<_>>>()?;
        ensure!(
            !fields.is_empty(),
            SchemaValidationSnafu {
                reason: "partition spec must name at least one column",
            }
        );

        let mut seen = HashSet::new();
        for field in &fields {
            ensure!(
                seen.insert(field.to_string()),
                SchemaValidationSnafu {
                    reason: format!("partition field {field} is listed more than once"),
                }
            );
        }

        Ok(Self { fields })
    }

    /// The fields in spec order.
    pub fn fields(&self) -> &[PartitionField] {
        &self.fields
    }

    /// Source columns referenced by the spec, in spec order.
    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.column.as_str()).collect()
    }

    /// True when every field is a plain column.
    pub fn is_identity_only(&self) -> bool {
        self.fields.iter().all(PartitionField::is_identity)
    }

    /// Textual entries, e.g. `["region", "year(ts)"]`.
    pub fn expressions(&self) -> Vec<String> {
        self.fields.iter().map(ToString::to_string).collect()
    }

    /// Check every field against `schema`.
    pub fn check_against(&self, schema: &Schema) -> EngineResult<()> {
        self.fields.iter().try_for_each(|f| f.check_against(schema))
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expressions().join(", "))
    }
}

impl TryFrom<Vec<String>> for PartitionSpec {
    type Error = EngineError;

    fn try_from(entries: Vec<String>) -> Result<Self, Self::Error> {
        PartitionSpec::parse(entries)
    }
}

impl From<PartitionSpec> for Vec<String> {
    fn from(spec: PartitionSpec) -> Self {
        spec.expressions()
    }
}

/// A single non-null partition value.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionValue {
    /// Signed integer of any width.
    Int(i64),
    /// Unsigned integer of any width.
    UInt(u64),
    /// 32-bit float, formatted from its own shortest representation.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// Text, including dates and timestamps rendered by Arrow.
    Text(String),
}

impl PartitionValue {
    fn render(&self, column: &str) -> EngineResult<String> {
        let rendered = match self {
            PartitionValue::Int(v) => v.to_string(),
            PartitionValue::UInt(v) => v.to_string(),
            PartitionValue::Float32(v) => {
                ensure!(
                    v.is_finite(),
                    InvalidPartitionValueSnafu {
                        column,
                        reason: format!("{v} is not a finite number"),
                    }
                );
                if v.fract() == 0.0 {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            PartitionValue::Float64(v) => {
                ensure!(
                    v.is_finite(),
                    InvalidPartitionValueSnafu {
                        column,
                        reason: format!("{v} is not a finite number"),
                    }
                );
                if v.fract() == 0.0 {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            PartitionValue::Bool(v) => v.to_string(),
            PartitionValue::Text(v) => escape(v),
        };
        Ok(rendered)
    }
}

/// Encode one column value as a `column=value` folder segment.
///
/// A `None` value is a null and fails with `InvalidPartitionValue`.
pub fn encode(column: &str, value: Option<&PartitionValue>) -> EngineResult<String> {
    let value = value.context(InvalidPartitionValueSnafu {
        column,
        reason: "null values cannot be used as partition keys",
    })?;
    Ok(format!("{}={}", escape(column), value.render(column)?))
}

/// Split a `column=value` folder segment into its column and raw value.
pub fn decode(segment: &str) -> EngineResult<(String, String)> {
    let (column, raw) = segment
        .split_once('=')
        .context(InvalidPartitionValueSnafu {
            column: segment,
            reason: "folder segment is not of the form column=value",
        })?;
    Ok((unescape(segment, column)?, unescape(segment, raw)?))
}

fn needs_escape(c: char) -> bool {
    matches!(c, '/' | '\\' | '=' | '%') || c.is_control()
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape(segment: &str, escaped: &str) -> EngineResult<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let byte = escaped
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .context(InvalidPartitionValueSnafu {
                    column: segment,
                    reason: "invalid percent escape",
                })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok().context(InvalidPartitionValueSnafu {
        column: segment,
        reason: "escaped value is not valid UTF-8",
    })
}

/// Encoded partition combination: one `column=value` segment per spec field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey {
    segments: Vec<String>,
}

impl PartitionKey {
    /// Build a key from already encoded segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// The encoded segments in spec order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Relative folder for this combination, e.g. `year=2024/month=1`.
    pub fn folder(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Decode every segment into `(column, raw value)` pairs.
    pub fn decode(&self) -> EngineResult<Vec<(String, String)>> {
        self.segments.iter().map(|s| decode(s)).collect()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Column prepared for per-row value extraction.
enum KeyColumn {
    Int(arrow::array::Int64Array),
    UInt(arrow::array::UInt64Array),
    Float32(arrow::array::Float32Array),
    Float64(arrow::array::Float64Array),
    Bool(BooleanArray),
    Text(arrow::array::StringArray),
}

impl KeyColumn {
    fn prepare(column: &str, array: &ArrayRef) -> EngineResult<Self> {
        let prepared = match array.data_type() {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                let casted = cast(array, &DataType::Int64).context(ArrowSnafu)?;
                KeyColumn::Int(casted.as_primitive::<Int64Type>().clone())
            }
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                let casted = cast(array, &DataType::UInt64).context(ArrowSnafu)?;
                KeyColumn::UInt(casted.as_primitive::<UInt64Type>().clone())
            }
            DataType::Float16 | DataType::Float32 => {
                let casted = cast(array, &DataType::Float32).context(ArrowSnafu)?;
                KeyColumn::Float32(casted.as_primitive::<Float32Type>().clone())
            }
            DataType::Float64 => KeyColumn::Float64(array.as_primitive::<Float64Type>().clone()),
            DataType::Boolean => KeyColumn::Bool(array.as_boolean().clone()),
            other if can_cast_types(other, &DataType::Utf8) => {
                let casted = cast(array, &DataType::Utf8).context(ArrowSnafu)?;
                KeyColumn::Text(casted.as_string::<i32>().clone())
            }
            other => {
                return InvalidPartitionValueSnafu {
                    column,
                    reason: format!("values of type {other} cannot be partition keys"),
                }
                .fail();
            }
        };
        Ok(prepared)
    }

    fn value(&self, row: usize) -> Option<PartitionValue> {
        match self {
            KeyColumn::Int(a) => a.is_valid(row).then(|| PartitionValue::Int(a.value(row))),
            KeyColumn::UInt(a) => a.is_valid(row).then(|| PartitionValue::UInt(a.value(row))),
            KeyColumn::Float32(a) => a
                .is_valid(row)
                .then(|| PartitionValue::Float32(a.value(row))),
            KeyColumn::Float64(a) => a
                .is_valid(row)
                .then(|| PartitionValue::Float64(a.value(row))),
            KeyColumn::Bool(a) => a.is_valid(row).then(|| PartitionValue::Bool(a.value(row))),
            KeyColumn::Text(a) => a
                .is_valid(row)
                .then(|| PartitionValue::Text(a.value(row).to_string())),
        }
    }
}

/// Compute the partition key of every row of `batch`.
pub fn row_keys(batch: &RecordBatch, spec: &PartitionSpec) -> EngineResult<Vec<PartitionKey>> {
    spec.check_against(batch.schema().as_ref())?;

    let mut columns = Vec::with_capacity(spec.fields().len());
    for field in spec.fields() {
        let source = batch
            .column_by_name(&field.column)
            .context(SchemaValidationSnafu {
                reason: format!("partition column {:?} is not present in the rows", field.column),
            })?;
        let derived = match field.transform.date_part() {
            None => source.clone(),
            Some(part) => date_part(source.as_ref(), part).context(ArrowSnafu)?,
        };
        // Segment names use the field expression so `year(ts)` and `ts` never collide.
        columns.push((field.to_string(), KeyColumn::prepare(&field.column, &derived)?));
    }

    (0..batch.num_rows())
        .map(|row| {
            let segments = columns
                .iter()
                .map(|(name, column)| encode(name, column.value(row).as_ref()))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(PartitionKey::from_segments(segments))
        })
        .collect()
}

/// Distinct partition keys of `batch`, in order of first appearance.
pub fn distinct_keys(batch: &RecordBatch, spec: &PartitionSpec) -> EngineResult<Vec<PartitionKey>> {
    let mut seen = HashSet::new();
    Ok(row_keys(batch, spec)?
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect())
}

/// Split `batch` into one batch per partition key, in order of first appearance.
pub fn split_by_partition(
    batch: &RecordBatch,
    spec: &PartitionSpec,
) -> EngineResult<Vec<(PartitionKey, RecordBatch)>> {
    let mut groups: Vec<(PartitionKey, Vec<u32>)> = Vec::new();
    let mut slots: HashMap<PartitionKey, usize> = HashMap::new();

    for (row, key) in row_keys(batch, spec)?.into_iter().enumerate() {
        let slot = match slots.get(&key) {
            Some(slot) => *slot,
            None => {
                slots.insert(key.clone(), groups.len());
                groups.push((key, Vec::new()));
                groups.len() - 1
            }
        };
        groups[slot].1.push(row as u32);
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let indices = UInt32Array::from(rows);
            let part = take_record_batch(batch, &indices).context(ArrowSnafu)?;
            Ok((key, part))
        })
        .collect()
}

//! Column schemas: the logical types recorded in catalog metadata, plus the
//! plain column listings and deltas reported by previews.

use std::{collections::HashSet, fmt, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Errors produced while mapping Arrow schemas to logical schemas.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaConvertError {
    /// The column's Arrow type has no logical counterpart.
    #[snafu(display("Column {column} has unsupported type {data_type}"))]
    UnsupportedType {
        /// Column name.
        column: String,
        /// Arrow type rendered as text.
        data_type: String,
    },

    /// The same column name appears twice.
    #[snafu(display("Column {column} appears more than once"))]
    DuplicateColumn {
        /// Column name.
        column: String,
    },
}

/// Units for logical timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogicalTimestampUnit {
    /// Second precision.
    Seconds,
    /// Millisecond precision.
    Millis,
    /// Microsecond precision.
    Micros,
    /// Nanosecond precision.
    Nanos,
}

impl LogicalTimestampUnit {
    fn from_arrow(unit: &TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => LogicalTimestampUnit::Seconds,
            TimeUnit::Millisecond => LogicalTimestampUnit::Millis,
            TimeUnit::Microsecond => LogicalTimestampUnit::Micros,
            TimeUnit::Nanosecond => LogicalTimestampUnit::Nanos,
        }
    }

    fn to_arrow(self) -> TimeUnit {
        match self {
            LogicalTimestampUnit::Seconds => TimeUnit::Second,
            LogicalTimestampUnit::Millis => TimeUnit::Millisecond,
            LogicalTimestampUnit::Micros => TimeUnit::Microsecond,
            LogicalTimestampUnit::Nanos => TimeUnit::Nanosecond,
        }
    }
}

impl fmt::Display for LogicalTimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalTimestampUnit::Seconds => write!(f, "s"),
            LogicalTimestampUnit::Millis => write!(f, "ms"),
            LogicalTimestampUnit::Micros => write!(f, "us"),
            LogicalTimestampUnit::Nanos => write!(f, "ns"),
        }
    }
}

/// Column types a catalog table can record.
///
/// Table schemas are derived from the incoming rows' Arrow types through an
/// explicit mapping, so a table's declared types never depend on whatever
/// a particular data file happens to contain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogicalDataType {
    /// Boolean value.
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit unsigned integer.
    UInt64,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    Utf8,
    /// Variable-length binary data.
    Binary,
    /// Days since the Unix epoch.
    Date32,
    /// Milliseconds since the Unix epoch.
    Date64,
    /// Timestamp with a precision unit and optional timezone.
    Timestamp {
        /// Timestamp precision unit.
        unit: LogicalTimestampUnit,
        /// Optional timezone identifier.
        timezone: Option<String>,
    },
    /// Fixed-precision decimal.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Digits right of the decimal point.
        scale: i8,
    },
}

impl LogicalDataType {
    /// Map an Arrow type to its logical counterpart.
    ///
    /// Large/view string and binary layouts collapse onto `Utf8`/`Binary`.
    pub fn from_arrow(column: &str, data_type: &DataType) -> Result<Self, SchemaConvertError> {
        let logical = match data_type {
            DataType::Boolean => LogicalDataType::Bool,
            DataType::Int8 => LogicalDataType::Int8,
            DataType::Int16 => LogicalDataType::Int16,
            DataType::Int32 => LogicalDataType::Int32,
            DataType::Int64 => LogicalDataType::Int64,
            DataType::UInt8 => LogicalDataType::UInt8,
            DataType::UInt16 => LogicalDataType::UInt16,
            DataType::UInt32 => LogicalDataType::UInt32,
            DataType::UInt64 => LogicalDataType::UInt64,
            DataType::Float32 => LogicalDataType::Float32,
            DataType::Float64 => LogicalDataType::Float64,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => LogicalDataType::Utf8,
            DataType::Binary | DataType::LargeBinary | DataType::BinaryView => {
                LogicalDataType::Binary
            }
            DataType::Date32 => LogicalDataType::Date32,
            DataType::Date64 => LogicalDataType::Date64,
            DataType::Timestamp(unit, tz) => LogicalDataType::Timestamp {
                unit: LogicalTimestampUnit::from_arrow(unit),
                timezone: tz.as_ref().map(|tz| tz.to_string()),
            },
            DataType::Decimal128(precision, scale) => LogicalDataType::Decimal {
                precision: *precision,
                scale: *scale,
            },
            other => {
                return UnsupportedTypeSnafu {
                    column,
                    data_type: other.to_string(),
                }
                .fail();
            }
        };
        Ok(logical)
    }

    /// The Arrow type data files of this column are written with.
    pub fn to_arrow(&self) -> DataType {
        match self {
            LogicalDataType::Bool => DataType::Boolean,
            LogicalDataType::Int8 => DataType::Int8,
            LogicalDataType::Int16 => DataType::Int16,
            LogicalDataType::Int32 => DataType::Int32,
            LogicalDataType::Int64 => DataType::Int64,
            LogicalDataType::UInt8 => DataType::UInt8,
            LogicalDataType::UInt16 => DataType::UInt16,
            LogicalDataType::UInt32 => DataType::UInt32,
            LogicalDataType::UInt64 => DataType::UInt64,
            LogicalDataType::Float32 => DataType::Float32,
            LogicalDataType::Float64 => DataType::Float64,
            LogicalDataType::Utf8 => DataType::Utf8,
            LogicalDataType::Binary => DataType::Binary,
            LogicalDataType::Date32 => DataType::Date32,
            LogicalDataType::Date64 => DataType::Date64,
            LogicalDataType::Timestamp { unit, timezone } => {
                DataType::Timestamp(unit.to_arrow(), timezone.as_deref().map(Arc::from))
            }
            LogicalDataType::Decimal { precision, scale } => {
                DataType::Decimal128(*precision, *scale)
            }
        }
    }
}

impl fmt::Display for LogicalDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalDataType::Bool => write!(f, "bool"),
            LogicalDataType::Int8 => write!(f, "int8"),
            LogicalDataType::Int16 => write!(f, "int16"),
            LogicalDataType::Int32 => write!(f, "int32"),
            LogicalDataType::Int64 => write!(f, "int64"),
            LogicalDataType::UInt8 => write!(f, "uint8"),
            LogicalDataType::UInt16 => write!(f, "uint16"),
            LogicalDataType::UInt32 => write!(f, "uint32"),
            LogicalDataType::UInt64 => write!(f, "uint64"),
            LogicalDataType::Float32 => write!(f, "float32"),
            LogicalDataType::Float64 => write!(f, "float64"),
            LogicalDataType::Utf8 => write!(f, "utf8"),
            LogicalDataType::Binary => write!(f, "binary"),
            LogicalDataType::Date32 => write!(f, "date32"),
            LogicalDataType::Date64 => write!(f, "date64"),
            LogicalDataType::Timestamp { unit, timezone } => match timezone {
                Some(tz) => write!(f, "timestamp[{unit}, tz={tz}]"),
                None => write!(f, "timestamp[{unit}]"),
            },
            LogicalDataType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
        }
    }
}

/// One column of a logical schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogicalField {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub data_type: LogicalDataType,
    /// Whether the column allows nulls.
    pub nullable: bool,
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{}?: {}", self.name, self.data_type)
        } else {
            write!(f, "{}: {}", self.name, self.data_type)
        }
    }
}

/// Ordered, duplicate-free list of logical columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LogicalSchema {
    fields: Vec<LogicalField>,
}

impl LogicalSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(fields: Vec<LogicalField>) -> Result<Self, SchemaConvertError> {
        let mut seen = HashSet::new();
        for field in &fields {
            ensure!(
                seen.insert(field.name.as_str()),
                DuplicateColumnSnafu {
                    column: field.name.clone()
                }
            );
        }
        Ok(Self { fields })
    }

    /// Derive a logical schema from an Arrow schema.
    pub fn from_arrow(schema: &Schema) -> Result<Self, SchemaConvertError> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(LogicalField {
                    name: f.name().clone(),
                    data_type: LogicalDataType::from_arrow(f.name(), f.data_type())?,
                    nullable: f.is_nullable(),
                })
            })
            .collect::<Result<Vec<_>, SchemaConvertError>>()?;
        Self::new(fields)
    }

    /// The Arrow schema data files are written with.
    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| Field::new(f.name.clone(), f.data_type.to_arrow(), f.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Columns in declaration order.
    pub fn fields(&self) -> &[LogicalField] {
        &self.fields
    }

    /// Look up a column by name.
    pub fn field(&self, name: &str) -> Option<&LogicalField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A column name and type as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Arrow type.
    pub data_type: DataType,
    /// Whether the column allows nulls.
    pub nullable: bool,
}

impl ColumnSchema {
    /// List the columns of an Arrow schema.
    pub fn list(schema: &Schema) -> Vec<ColumnSchema> {
        schema
            .fields()
            .iter()
            .map(|f| ColumnSchema {
                name: f.name().clone(),
                data_type: f.data_type().clone(),
                nullable: f.is_nullable(),
            })
            .collect()
    }
}

impl fmt::Display for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type)
    }
}

/// A column whose type differs between the existing target and the incoming rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeChange {
    /// Column name.
    pub column: String,
    /// Type currently stored.
    pub existing: DataType,
    /// Type of the incoming rows.
    pub incoming: DataType,
}

/// Differences between an existing schema and an incoming one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDelta {
    /// Columns present only in the incoming rows.
    pub added: Vec<String>,
    /// Columns present only in the existing target.
    pub removed: Vec<String>,
    /// Columns present in both with different types.
    pub type_changes: Vec<TypeChange>,
}

impl SchemaDelta {
    /// Compare `existing` against `incoming` by column name.
    pub fn between(existing: &Schema, incoming: &Schema) -> Self {
        let mut delta = SchemaDelta::default();
        for field in incoming.fields() {
            match existing.field_with_name(field.name()) {
                Ok(current) if current.data_type() != field.data_type() => {
                    delta.type_changes.push(TypeChange {
                        column: field.name().clone(),
                        existing: current.data_type().clone(),
                        incoming: field.data_type().clone(),
                    });
                }
                Ok(_) => {}
                Err(_) => delta.added.push(field.name().clone()),
            }
        }
        for field in existing.fields() {
            if incoming.field_with_name(field.name()).is_err() {
                delta.removed.push(field.name().clone());
            }
        }
        delta
    }

    /// True when both schemas have the same columns and types.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.type_changes.is_empty()
    }
}

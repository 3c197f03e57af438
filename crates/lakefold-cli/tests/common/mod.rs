#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use arrow::{
    array::{ArrayRef, Int64Array, StringArray},
    record_batch::RecordBatch,
};
use assert_cmd::Command;
use parquet::arrow::ArrowWriter;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("lakefold"))
}

/// Lossy path string for command arguments.
pub fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Write `{id, name, year}` rows as Parquet.
pub fn write_parquet_rows(path: &Path, rows: &[(i64, &str, i64)]) -> TestResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let batch = RecordBatch::try_from_iter(vec![
        (
            "id",
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))) as ArrayRef,
        ),
        (
            "name",
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))) as ArrayRef,
        ),
        (
            "year",
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.2))) as ArrayRef,
        ),
    ])?;

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Write `{id, name, year}` rows as CSV with a header line.
pub fn write_csv_rows(path: &Path, rows: &[(i64, &str, i64)]) -> TestResult {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = String::from("id,name,year\n");
    for (id, name, year) in rows {
        text.push_str(&format!("{id},{name},{year}\n"));
    }
    std::fs::write(path, text)?;
    Ok(())
}

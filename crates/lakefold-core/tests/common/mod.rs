//! Shared builders for the engine integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray},
    compute::{SortOptions, sort_to_indices, take_record_batch},
    datatypes::Int64Type,
    record_batch::RecordBatch,
};
use lakefold_core::{CatalogTarget, FolderTarget, Relation, Session, SessionConfig};
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const CATALOG: &str = "lake";

/// `{id, year}` rows.
pub fn id_year(ids: &[i64], years: &[i64]) -> RecordBatch {
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef),
        ("year", Arc::new(Int64Array::from(years.to_vec())) as ArrayRef),
    ])
    .expect("valid batch")
}

/// `{id, name, score}` rows; `name` and `score` are nullable.
pub fn people(ids: &[i64], names: &[&str], scores: &[f64]) -> RecordBatch {
    RecordBatch::try_from_iter_with_nullable(vec![
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef, false),
        ("name", Arc::new(StringArray::from(names.to_vec())) as ArrayRef, true),
        ("score", Arc::new(Float64Array::from(scores.to_vec())) as ArrayRef, true),
    ])
    .expect("valid batch")
}

pub fn folder_session(tmp: &TempDir) -> Session {
    let mut session = Session::new(SessionConfig::default());
    session.connect_folder(tmp.path().join("lake"));
    session
}

pub fn catalog_session(tmp: &TempDir) -> Session {
    catalog_session_with(tmp, SessionConfig::default())
}

pub fn catalog_session_with(tmp: &TempDir, config: SessionConfig) -> Session {
    let mut session = Session::new(config);
    session.connect_catalog(tmp.path().join("catalog"), CATALOG);
    session
}

pub fn dataset(section: &str, name: &str) -> FolderTarget {
    FolderTarget::new(section, name).expect("valid folder target")
}

pub fn table(name: &str) -> CatalogTarget {
    CatalogTarget::new(CATALOG, "main", name).expect("valid catalog target")
}

/// Sort a batch by its `id` column.
pub fn sorted_by_id(batch: &RecordBatch) -> RecordBatch {
    let ids = batch.column_by_name("id").expect("id column");
    let order = sort_to_indices(ids, Some(SortOptions::default()), None).expect("sortable");
    take_record_batch(batch, &order).expect("take")
}

pub fn int_values(batch: &RecordBatch, column: &str) -> Vec<i64> {
    batch
        .column_by_name(column)
        .expect("column present")
        .as_primitive::<Int64Type>()
        .values()
        .to_vec()
}

pub fn string_values(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
    let array = batch.column_by_name(column).expect("column present");
    let strings = array.as_string::<i32>();
    (0..strings.len())
        .map(|i| strings.is_valid(i).then(|| strings.value(i).to_string()))
        .collect()
}

/// Relation contents sorted by `id`.
pub async fn collect_sorted(relation: &Relation) -> RecordBatch {
    sorted_by_id(&relation.collect_batch().await.expect("collect"))
}

/// `id` values of a relation, ascending.
pub async fn ids(relation: &Relation) -> Vec<i64> {
    let mut ids = int_values(&relation.collect_batch().await.expect("collect"), "id");
    ids.sort_unstable();
    ids
}

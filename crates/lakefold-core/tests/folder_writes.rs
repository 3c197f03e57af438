//! Folder backend writes: modes, partition layout and governance.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use arrow::{
    array::{ArrayRef, Int32Array, Int64Array, StringArray},
    datatypes::DataType,
    record_batch::RecordBatch,
};
use common::*;
use lakefold_core::{
    EngineError, FilenamePattern, Session, SessionConfig, WriteLocation, WriteMode, WriteRequest,
    governance::GovernanceRules, partition::PartitionSpec,
};
use tempfile::TempDir;

/// Every file under `dir`, keyed by its path relative to `dir`, with its bytes.
fn snapshot_files(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).expect("read dir") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).expect("under root");
                out.insert(
                    rel.to_string_lossy().replace('\\', "/"),
                    std::fs::read(&path).expect("read file"),
                );
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

#[tokio::test]
async fn overwrite_then_replace_partitions() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("sales", "orders");

    let first = session
        .write(
            WriteRequest::new(target.clone(), id_year(&[1, 2, 3, 4], &[2023, 2023, 2024, 2024]), WriteMode::Overwrite)
                .partition_by(["year"]),
        )
        .await?;
    assert!(first.written);
    assert_eq!(first.files_written, 2);
    assert_eq!(
        first.location,
        WriteLocation::Path(tmp.path().join("lake").join("sales").join("orders"))
    );

    session
        .write(
            WriteRequest::new(target.clone(), id_year(&[5, 6], &[2024, 2024]), WriteMode::ReplacePartitions)
                .partition_by(["year"]),
        )
        .await?;

    let relation = session.read(&target.clone().into()).await?;
    let rows = collect_sorted(&relation).await;
    assert_eq!(int_values(&rows, "id"), vec![1, 2, 5, 6]);
    assert_eq!(int_values(&rows, "year"), vec![2023, 2023, 2024, 2024]);
    Ok(())
}

#[tokio::test]
async fn replace_partitions_only_touches_incoming_partitions() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("sales", "orders");
    let dir = tmp.path().join("lake/sales/orders");

    session
        .write(
            WriteRequest::new(target.clone(), id_year(&[1, 2, 3], &[2021, 2022, 2023]), WriteMode::Overwrite)
                .partition_by(["year"]),
        )
        .await?;
    let before = snapshot_files(&dir);

    session
        .write(
            WriteRequest::new(target.clone(), id_year(&[20, 21], &[2022, 2024]), WriteMode::ReplacePartitions)
                .partition_by(["year"]),
        )
        .await?;
    let after = snapshot_files(&dir);

    for untouched in ["year=2021/data_0.parquet", "year=2023/data_0.parquet"] {
        assert_eq!(before.get(untouched), after.get(untouched), "{untouched} changed");
    }
    assert!(!after.contains_key("year=2022/data_0.parquet"));
    assert_eq!(after.keys().filter(|k| k.starts_with("year=2022/")).count(), 1);
    assert_eq!(after.keys().filter(|k| k.starts_with("year=2024/")).count(), 1);

    let rows = collect_sorted(&session.read(&target.into()).await?).await;
    assert_eq!(int_values(&rows, "id"), vec![1, 3, 20, 21]);
    assert_eq!(int_values(&rows, "year"), vec![2021, 2023, 2022, 2024]);
    Ok(())
}

#[tokio::test]
async fn append_adds_files_next_to_existing_ones() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("raw", "events");

    for (ids, years) in [([1, 2], [2024, 2024]), ([3, 4], [2024, 2025])] {
        session
            .write(WriteRequest::new(target.clone(), id_year(&ids, &years), WriteMode::Append).partition_by(["year"]))
            .await?;
    }

    let relation = session.read(&target.into()).await?;
    assert_eq!(relation.file_count(), 3);
    assert_eq!(ids(&relation).await, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn ignore_if_exists_leaves_dataset_alone() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("raw", "events");

    let created = session
        .write(WriteRequest::new(target.clone(), id_year(&[1], &[2024]), WriteMode::IgnoreIfExists))
        .await?;
    assert!(created.written);

    let skipped = session
        .write(WriteRequest::new(target.clone(), id_year(&[9, 9], &[2024, 2024]), WriteMode::IgnoreIfExists))
        .await?;
    assert!(!skipped.written);
    assert_eq!(skipped.files_written, 0);
    assert_eq!(ids(&session.read(&target.into()).await?).await, vec![1]);
    Ok(())
}

#[tokio::test]
async fn overwrite_without_partitions_replaces_everything() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("raw", "events");

    session
        .write(WriteRequest::new(target.clone(), id_year(&[1, 2], &[2023, 2024]), WriteMode::Overwrite).partition_by(["year"]))
        .await?;
    session
        .write(WriteRequest::new(target.clone(), id_year(&[7], &[2030]), WriteMode::Overwrite))
        .await?;

    let relation = session.read(&target.clone().into()).await?;
    assert_eq!(relation.file_count(), 1);
    let columns: Vec<String> = session
        .describe(&target.into())
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(columns, vec!["id", "year"]);
    Ok(())
}

#[tokio::test]
async fn append_and_replace_require_a_partition_spec() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("raw", "events");

    for mode in [WriteMode::Append, WriteMode::ReplacePartitions] {
        let err = session
            .write(WriteRequest::new(target.clone(), id_year(&[1], &[2024]), mode))
            .await
            .expect_err("spec required");
        assert!(matches!(err, EngineError::InvalidRequest { .. }), "{mode}: {err}");
    }
    assert!(!tmp.path().join("lake/raw/events").exists());
    Ok(())
}

#[tokio::test]
async fn unique_patterns_are_required_for_appends() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let err = session
        .write(
            WriteRequest::new(dataset("raw", "events"), id_year(&[1], &[2024]), WriteMode::Append)
                .partition_by(["year"])
                .filename_pattern(FilenamePattern::new("part_{i}")?),
        )
        .await
        .expect_err("pattern without uuid");
    assert!(matches!(err, EngineError::InvalidRequest { .. }));
    Ok(())
}

#[tokio::test]
async fn governance_requires_the_exact_spec() -> TestResult {
    let tmp = TempDir::new()?;
    let config = SessionConfig {
        governance: GovernanceRules::new().with_rule(
            "hr",
            "people",
            PartitionSpec::parse(["name", "score"])?,
        ),
        ..SessionConfig::default()
    };
    let mut session = Session::new(config);
    session.connect_folder(tmp.path());
    let target = dataset("hr", "people");
    let rows = || people(&[1, 2], &["a", "b"], &[1.0, 2.0]);

    for supplied in [None, Some(vec!["name"]), Some(vec!["score", "name"])] {
        let mut request = WriteRequest::new(target.clone(), rows(), WriteMode::Overwrite);
        if let Some(cols) = supplied.clone() {
            request = request.partition_by(cols);
        }
        let err = session.write(request).await.expect_err("governed");
        assert!(
            matches!(err, EngineError::PartitionGovernanceViolation { .. }),
            "{supplied:?}: {err}"
        );
    }
    assert!(!tmp.path().join("hr").exists());

    session
        .write(WriteRequest::new(target, rows(), WriteMode::Overwrite).partition_by(["name", "score"]))
        .await?;

    // Other datasets are not governed.
    session
        .write(WriteRequest::new(dataset("hr", "teams"), rows(), WriteMode::Overwrite))
        .await?;
    Ok(())
}

#[tokio::test]
async fn partition_values_become_folder_names() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let rows = people(&[1, 2], &["a/b", "c"], &[2.0, 2.5]);

    session
        .write(
            WriteRequest::new(dataset("raw", "people"), rows, WriteMode::Overwrite)
                .partition_by(["score", "name"]),
        )
        .await?;

    let dir = tmp.path().join("lake/raw/people");
    assert!(dir.join("score=2.0/name=a%2Fb/data_0.parquet").exists());
    assert!(dir.join("score=2.5/name=c/data_0.parquet").exists());
    Ok(())
}

#[tokio::test]
async fn invalid_identifiers_fail_before_io() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = lakefold_core::FolderTarget {
        section: "../escape".to_string(),
        dataset: "x".to_string(),
    };
    let err = session
        .write(WriteRequest::new(target, id_year(&[1], &[2024]), WriteMode::Overwrite))
        .await
        .expect_err("invalid section");
    assert!(matches!(err, EngineError::InvalidIdentifier { .. }));
    assert!(!tmp.path().join("lake").exists());
    Ok(())
}

#[tokio::test]
async fn partition_columns_keep_their_written_types() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("geo", "visits");
    let rows = RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
        ("zip", Arc::new(StringArray::from(vec!["02134", "10001"])) as ArrayRef),
        ("year", Arc::new(Int32Array::from(vec![2024, 2025])) as ArrayRef),
    ])?;

    session
        .write(WriteRequest::new(target.clone(), rows, WriteMode::Overwrite).partition_by(["zip", "year"]))
        .await?;
    assert!(tmp.path().join("lake/geo/visits/zip=02134/year=2024/data_0.parquet").exists());

    let relation = session.read(&target.into()).await?;
    let schema = relation.schema();
    assert_eq!(schema.field_with_name("zip")?.data_type(), &DataType::Utf8);
    assert_eq!(schema.field_with_name("year")?.data_type(), &DataType::Int32);

    let rows = collect_sorted(&relation).await;
    assert_eq!(
        string_values(&rows, "zip"),
        vec![Some("02134".to_string()), Some("10001".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn empty_partitioned_overwrite_reads_back_empty() -> TestResult {
    let tmp = TempDir::new()?;
    let session = folder_session(&tmp);
    let target = dataset("raw", "events");

    session
        .write(WriteRequest::new(target.clone(), id_year(&[1, 2], &[2023, 2024]), WriteMode::Overwrite).partition_by(["year"]))
        .await?;
    let outcome = session
        .write(WriteRequest::new(target.clone(), id_year(&[], &[]), WriteMode::Overwrite).partition_by(["year"]))
        .await?;
    assert_eq!(outcome.files_written, 1);
    assert!(!tmp.path().join("lake/raw/events/year=2023").exists());

    let relation = session.read(&target.into()).await?;
    assert_eq!(relation.count_rows().await?, 0);
    let names: Vec<String> = relation.schema().fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(names, vec!["id", "year"]);
    assert_eq!(relation.schema().field_with_name("year")?.data_type(), &DataType::Int64);
    Ok(())
}

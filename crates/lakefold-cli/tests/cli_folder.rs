//! Folder-mode workflows through the CLI binary.

mod common;

use predicates::{prelude::PredicateBooleanExt, str::contains};
use tempfile::TempDir;

use common::{TestResult, arg, cli, write_csv_rows, write_parquet_rows};

#[test]
fn write_partitioned_csv_then_show() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let input = tmp.path().join("people.csv");
    write_csv_rows(&input, &[(1, "a", 2023), (2, "b", 2024), (3, "c", 2024)])?;

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "hr/people"])
        .args(["--input", &arg(&input), "--partition-by", "year"])
        .assert()
        .success()
        .stdout(contains("Wrote 2 file(s)"));

    assert!(base.join("hr/people/year=2023").is_dir());
    assert!(base.join("hr/people/year=2024").is_dir());

    cli()
        .args(["show", "--folder", &arg(&base), "--dataset", "hr/people"])
        .assert()
        .success()
        .stdout(contains("| c ").and(contains("year")));

    cli()
        .args(["show", "--folder", &arg(&base), "--dataset", "hr/people"])
        .args(["--schema"])
        .assert()
        .success()
        .stdout(contains("id").and(contains("Int64")));
    Ok(())
}

#[test]
fn replace_partitions_dry_run_changes_nothing() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let first = tmp.path().join("first.parquet");
    let second = tmp.path().join("second.parquet");
    write_parquet_rows(&first, &[(1, "a", 2023), (2, "b", 2024)])?;
    write_parquet_rows(&second, &[(9, "z", 2024), (10, "y", 2025)])?;

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "sales/orders"])
        .args(["--input", &arg(&first), "--partition-by", "year"])
        .assert()
        .success();

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "sales/orders"])
        .args(["--input", &arg(&second), "--partition-by", "year"])
        .args(["--mode", "replace-partitions", "--dry-run"])
        .assert()
        .success()
        .stdout(
            contains("action: replace partitions")
                .and(contains("partitions to delete:"))
                .and(contains("year=2024")),
        );
    assert!(!base.join("sales/orders/year=2025").exists());

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "sales/orders"])
        .args(["--input", &arg(&second), "--partition-by", "year"])
        .args(["--mode", "replace-partitions"])
        .assert()
        .success();
    assert!(base.join("sales/orders/year=2025").is_dir());

    cli()
        .args(["show", "--folder", &arg(&base), "--dataset", "sales/orders"])
        .assert()
        .success()
        .stdout(contains("| a ").and(contains("| z ")).and(contains("| b ").not()));
    Ok(())
}

#[test]
fn ignore_mode_skips_existing_dataset() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let input = tmp.path().join("rows.parquet");
    write_parquet_rows(&input, &[(1, "a", 2023)])?;

    for expected in ["Wrote 1 file(s)", "Skipped"] {
        cli()
            .args(["write", "--folder", &arg(&base), "--dataset", "raw/events"])
            .args(["--input", &arg(&input), "--mode", "ignore"])
            .assert()
            .success()
            .stdout(contains(expected));
    }
    Ok(())
}

#[test]
fn append_without_partitioning_is_rejected_with_a_hint() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let input = tmp.path().join("rows.parquet");
    write_parquet_rows(&input, &[(1, "a", 2023)])?;

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "raw/events"])
        .args(["--input", &arg(&input), "--mode", "append"])
        .assert()
        .failure()
        .stderr(contains("hint: append and replace-partitions"));
    Ok(())
}

#[test]
fn governance_rules_come_from_the_config_file() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let input = tmp.path().join("rows.parquet");
    let config = tmp.path().join("lakefold.json");
    write_parquet_rows(&input, &[(1, "a", 2023)])?;
    std::fs::write(
        &config,
        r#"{"governance": [{"section": "hr", "dataset": "people", "partition_by": ["year"]}]}"#,
    )?;

    cli()
        .args(["--config", &arg(&config)])
        .args(["write", "--folder", &arg(&base), "--dataset", "hr/people"])
        .args(["--input", &arg(&input)])
        .assert()
        .failure()
        .stderr(contains("must be partitioned by [year]"));

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "hr/people"])
        .args(["--input", &arg(&input), "--partition-by", "year"])
        .args(["--config", &arg(&config)])
        .assert()
        .success();
    Ok(())
}

#[test]
fn bad_arguments_fail_cleanly() -> TestResult {
    let tmp = TempDir::new()?;
    let base = tmp.path().join("lake");
    let input = tmp.path().join("rows.txt");
    std::fs::write(&input, "id\n1\n")?;

    cli()
        .args(["write", "--folder", &arg(&base), "--dataset", "hr/people"])
        .args(["--input", &arg(&input)])
        .assert()
        .failure()
        .stderr(contains("Unsupported input"));

    cli()
        .args(["show", "--folder", &arg(&base), "--catalog", &arg(&base)])
        .assert()
        .failure()
        .stderr(contains("pass exactly one of --folder or --catalog"));

    cli()
        .args(["show", "--folder", &arg(&base), "--dataset", "people"])
        .assert()
        .failure()
        .stderr(contains("SECTION/DATASET"));
    Ok(())
}

//! Catalog-mode workflows through the CLI binary: commits, upserts and history.

mod common;

use std::path::Path;

use predicates::{prelude::PredicateBooleanExt, str::contains};
use tempfile::TempDir;

use common::{TestResult, arg, cli, write_parquet_rows};

/// Snapshot 1 holds ids 1 and 2; snapshot 2 renames id 2 and inserts id 3.
fn seed(tmp: &TempDir, catalog: &Path) -> TestResult {
    let initial = tmp.path().join("initial.parquet");
    let changes = tmp.path().join("changes.parquet");
    write_parquet_rows(&initial, &[(1, "a", 2023), (2, "b", 2024)])?;
    write_parquet_rows(&changes, &[(2, "B", 2024), (3, "c", 2024)])?;

    cli()
        .args(["write", "--catalog", &arg(catalog), "--table", "people"])
        .args(["--input", &arg(&initial)])
        .args(["--author", "alice", "--message", "initial load"])
        .assert()
        .success()
        .stdout(contains("(snapshot 1)"));

    cli()
        .args(["upsert", "--catalog", &arg(catalog), "--table", "people"])
        .args(["--input", &arg(&changes), "--by", "id"])
        .assert()
        .success()
        .stdout(contains("1 inserted, 1 updated (snapshot 2)"));
    Ok(())
}

#[test]
fn snapshots_and_time_travel() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;

    cli()
        .args(["snapshots", "--catalog", &arg(&catalog)])
        .assert()
        .success()
        .stdout(contains("by alice: initial load").and(contains("\n2 ")));

    cli()
        .args(["show", "--catalog", &arg(&catalog), "--table", "main.people"])
        .args(["--snapshot", "1"])
        .assert()
        .success()
        .stdout(contains("| b ").and(contains("| B ").not()));

    cli()
        .args(["show", "--catalog", &arg(&catalog), "--table", "people"])
        .assert()
        .success()
        .stdout(contains("| B ").and(contains("| c ")));
    Ok(())
}

#[test]
fn upsert_dry_run_reports_counts() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;
    let more = tmp.path().join("more.parquet");
    write_parquet_rows(&more, &[(3, "C", 2024), (4, "d", 2025)])?;

    cli()
        .args(["upsert", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--input", &arg(&more), "--by", "id", "--update-col", "name"])
        .args(["--dry-run"])
        .assert()
        .success()
        .stdout(
            contains("would insert: 1")
                .and(contains("would update: 1"))
                .and(contains("update columns: name")),
        );

    cli()
        .args(["snapshots", "--catalog", &arg(&catalog)])
        .assert()
        .success()
        .stdout(contains("\n3 ").not());
    Ok(())
}

#[test]
fn strict_upsert_rejects_duplicate_keys() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;
    let dupes = tmp.path().join("dupes.parquet");
    write_parquet_rows(&dupes, &[(7, "x", 2024), (7, "y", 2024)])?;

    cli()
        .args(["upsert", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--input", &arg(&dupes), "--by", "id", "--strict"])
        .assert()
        .failure()
        .stderr(contains("id=7").and(contains("hint: deduplicate")));
    Ok(())
}

#[test]
fn diff_rollback_and_vacuum() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;

    cli()
        .args(["diff", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--from-snapshot", "1", "--key", "id"])
        .assert()
        .success()
        .stdout(
            contains("added: 2 rows")
                .and(contains("removed: 1 rows"))
                .and(contains("modified: 1 rows")),
        );

    cli()
        .args(["rollback", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--snapshot", "1"])
        .assert()
        .success()
        .stdout(contains("Rolled back lake.main.people to version 1 (snapshot 3)"));

    cli()
        .args(["show", "--catalog", &arg(&catalog), "--table", "people"])
        .assert()
        .success()
        .stdout(contains("| b ").and(contains("| c ").not()));

    cli()
        .args(["vacuum", "--catalog", &arg(&catalog), "--older-than", "0s", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("Would expire 2 snapshot(s)"));

    cli()
        .args(["vacuum", "--catalog", &arg(&catalog), "--older-than", "0s"])
        .assert()
        .success()
        .stdout(contains("Expired 2 snapshot(s)"));

    cli()
        .args(["show", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--snapshot", "1"])
        .assert()
        .failure()
        .stderr(contains("hint: run `lakefold snapshots`"));
    Ok(())
}

#[test]
fn time_travel_arguments_are_validated() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;

    cli()
        .args(["rollback", "--catalog", &arg(&catalog), "--table", "people"])
        .assert()
        .failure()
        .stderr(contains("hint: pass --snapshot ID or --as-of TIME"));

    cli()
        .args(["show", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--as-of", "yesterday"])
        .assert()
        .failure()
        .stderr(contains("Invalid timestamp 'yesterday'"));

    cli()
        .args(["vacuum", "--catalog", &arg(&catalog), "--older-than", "soon"])
        .assert()
        .failure()
        .stderr(contains("Invalid --older-than"));
    Ok(())
}

#[test]
fn folder_only_modes_are_rejected_by_catalogs() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    let input = tmp.path().join("rows.parquet");
    write_parquet_rows(&input, &[(1, "a", 2023)])?;

    cli()
        .args(["write", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--input", &arg(&input), "--mode", "ignore"])
        .assert()
        .failure()
        .stderr(contains("ignore"));
    Ok(())
}

#[test]
fn set_partitioning_applies_to_later_writes() -> TestResult {
    let tmp = TempDir::new()?;
    let catalog = tmp.path().join("catalog");
    seed(&tmp, &catalog)?;

    cli()
        .args(["set-partitioning", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--partition-by", "year"])
        .assert()
        .success()
        .stdout(contains("Partitioned lake.main.people by year (snapshot 3)"));

    cli()
        .args(["set-partitioning", "--catalog", &arg(&catalog), "--table", "people"])
        .args(["--clear"])
        .assert()
        .success()
        .stdout(contains("Removed partitioning"));
    Ok(())
}

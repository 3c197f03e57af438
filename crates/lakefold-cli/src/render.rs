//! Plain-text output for command results.

use arrow::{record_batch::RecordBatch, util::pretty::pretty_format_batches};
use lakefold_core::{Snapshot, TableDiff, VacuumReport, WriteOutcome, schema::ColumnSchema};
use snafu::ResultExt;

use crate::error::{CliResult, RenderSnafu};

/// Format up to `max_rows` rows as a table, noting how many were cut.
pub fn rows(batch: &RecordBatch, max_rows: usize) -> CliResult<String> {
    let shown = batch.num_rows().min(max_rows);
    let mut out = pretty_format_batches(&[batch.slice(0, shown)])
        .context(RenderSnafu)?
        .to_string();
    let hidden = batch.num_rows() - shown;
    if hidden > 0 {
        out.push_str(&format!("\n... {hidden} more rows"));
    }
    Ok(out)
}

pub fn columns(columns: &[ColumnSchema]) -> String {
    columns
        .iter()
        .map(ColumnSchema::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn snapshots(snapshots: &[Snapshot]) -> String {
    if snapshots.is_empty() {
        return "No snapshots".to_string();
    }
    snapshots
        .iter()
        .map(Snapshot::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn write_outcome(outcome: &WriteOutcome) -> String {
    if !outcome.written {
        return format!("Skipped {}: target already exists", outcome.location);
    }
    let mut out = format!(
        "Wrote {} file(s) to {}",
        outcome.files_written, outcome.location
    );
    if let Some(snapshot) = &outcome.snapshot {
        out.push_str(&format!(" (snapshot {})", snapshot.snapshot_id));
    }
    out
}

pub fn diff(diff: &TableDiff, max_rows: usize) -> CliResult<String> {
    let mut sections = vec![
        format!("added: {} rows", diff.added.num_rows()),
        rows(&diff.added, max_rows)?,
        format!("removed: {} rows", diff.removed.num_rows()),
        rows(&diff.removed, max_rows)?,
    ];
    if let Some(modified) = &diff.modified {
        sections.push(format!("modified: {} rows", modified.after.num_rows()));
        sections.push("before:".to_string());
        sections.push(rows(&modified.before, max_rows)?);
        sections.push("after:".to_string());
        sections.push(rows(&modified.after, max_rows)?);
    }
    Ok(sections.join("\n"))
}

pub fn vacuum(report: &VacuumReport) -> String {
    let verb = if report.dry_run { "Would expire" } else { "Expired" };
    let mut lines = vec![format!(
        "{verb} {} snapshot(s) created before {}",
        report.expired.len(),
        report.cutoff.to_rfc3339()
    )];
    lines.extend(report.expired.iter().map(|s| format!("  {s}")));
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };
    lines.push(format!("{verb} {} file(s)", report.reclaimed_files.len()));
    lines.extend(
        report
            .reclaimed_files
            .iter()
            .map(|p| format!("  {}", p.display())),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array};

    use super::*;

    #[test]
    fn long_results_are_truncated() -> Result<(), Box<dyn std::error::Error>> {
        let batch = RecordBatch::try_from_iter(vec![(
            "id",
            Arc::new(Int64Array::from((0..25).collect::<Vec<i64>>())) as ArrayRef,
        )])?;
        let out = rows(&batch, 10)?;
        assert!(out.contains("| 9 "));
        assert!(!out.contains("| 10 "));
        assert!(out.ends_with("... 15 more rows"));
        Ok(())
    }

    #[test]
    fn empty_snapshot_list() {
        assert_eq!(snapshots(&[]), "No snapshots");
    }
}

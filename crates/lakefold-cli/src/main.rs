//! CLI for writing, upserting and time-travelling over lakefold tables.

mod error;
mod input;
mod render;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use lakefold_core::{
    AsOf, CatalogTarget, CommitInfo, FilenamePattern, FolderTarget, RetentionCutoff, Session,
    SessionConfig, UpsertRequest, WriteMode, WriteRequest, WriteTarget,
};
use snafu::ResultExt;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::error::{
    CliError, CliResult, InvalidRetentionSnafu, InvalidTargetSnafu, InvalidTimestampSnafu,
    LoadConfigSnafu,
};

const DEFAULT_CATALOG_NAME: &str = "lake";
const DEFAULT_SCHEMA: &str = "main";
const DEFAULT_LOG_FILTER: &str = "lakefold=info,warn";

#[derive(Debug, Parser)]
#[command(name = "lakefold", version, about)]
struct Cli {
    /// Session config file (JSON): governance rules, compression, default author
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

/// A folder dataset or a catalog table.
#[derive(Debug, Args)]
struct TargetArgs {
    /// Base directory of a folder store
    #[arg(long)]
    folder: Option<PathBuf>,

    /// Dataset inside the folder store, as SECTION/DATASET
    #[arg(long)]
    dataset: Option<String>,

    /// Root directory of a catalog
    #[arg(long)]
    catalog: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_CATALOG_NAME)]
    catalog_name: String,

    /// Catalog table, as TABLE or SCHEMA.TABLE (schema defaults to main)
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    /// Root directory of the catalog
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long, default_value = DEFAULT_CATALOG_NAME)]
    catalog_name: String,
}

#[derive(Debug, Args)]
struct TableArgs {
    #[command(flatten)]
    catalog: CatalogArgs,

    /// Catalog table, as TABLE or SCHEMA.TABLE (schema defaults to main)
    #[arg(long)]
    table: String,
}

#[derive(Debug, Args)]
struct CommitArgs {
    /// Commit message recorded with the snapshot
    #[arg(long)]
    message: Option<String>,

    /// Commit author (default: from config)
    #[arg(long)]
    author: Option<String>,
}

impl CommitArgs {
    fn into_info(self) -> CommitInfo {
        CommitInfo {
            author: self.author,
            message: self.message,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a Parquet or CSV file to a dataset or table
    Write {
        #[command(flatten)]
        target: TargetArgs,

        /// Rows to write (.parquet or .csv)
        #[arg(long)]
        input: PathBuf,

        /// overwrite, append, ignore or replace-partitions
        #[arg(long, default_value = "overwrite")]
        mode: WriteMode,

        /// Repeatable partition column or transform, e.g. year(ts)
        #[arg(long = "partition-by")]
        partition_by: Vec<String>,

        /// File name template; `{i}` is the file index, `{uuid}` a random id
        #[arg(long)]
        filename_pattern: Option<String>,

        #[command(flatten)]
        commit: CommitArgs,

        /// Print what would be written and change nothing
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Insert or update rows of a catalog table by key
    Upsert {
        #[command(flatten)]
        table: TableArgs,

        #[arg(long)]
        input: PathBuf,

        /// Repeatable key column
        #[arg(long = "by", required = true)]
        by: Vec<String>,

        /// Repeatable column to update on matched keys (default: all non-key columns)
        #[arg(long = "update-col", conflicts_with = "insert_only")]
        update_cols: Vec<String>,

        /// Only insert rows whose key is new
        #[arg(long, default_value_t = false)]
        insert_only: bool,

        /// Fail when the input repeats a key
        #[arg(long, default_value_t = false)]
        strict: bool,

        #[command(flatten)]
        commit: CommitArgs,

        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Change the partitioning of future writes to a catalog table
    SetPartitioning {
        #[command(flatten)]
        table: TableArgs,

        /// Repeatable partition column or transform
        #[arg(long = "partition-by", required_unless_present = "clear")]
        partition_by: Vec<String>,

        /// Remove partitioning
        #[arg(long, default_value_t = false, conflicts_with = "partition_by")]
        clear: bool,

        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Print the rows or columns of a dataset or table
    Show {
        #[command(flatten)]
        target: TargetArgs,

        /// Read the table as of this snapshot id
        #[arg(long)]
        snapshot: Option<u64>,

        /// Read the table as of this RFC3339 timestamp
        #[arg(long)]
        as_of: Option<String>,

        /// Print column names and types instead of rows
        #[arg(long, default_value_t = false)]
        schema: bool,

        #[arg(long, default_value_t = 20)]
        max_rows: usize,
    },
    /// List the retained snapshots of a catalog
    Snapshots {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// Rows added and removed between two snapshots of a table
    Diff {
        #[command(flatten)]
        table: TableArgs,

        #[arg(long)]
        from_snapshot: Option<u64>,

        #[arg(long)]
        from_time: Option<String>,

        /// Default: the current snapshot
        #[arg(long)]
        to_snapshot: Option<u64>,

        #[arg(long)]
        to_time: Option<String>,

        /// Repeatable key column; rows sharing a key are reported as modified
        #[arg(long = "key")]
        keys: Vec<String>,

        #[arg(long, default_value_t = 20)]
        max_rows: usize,
    },
    /// Restore a table's contents from an earlier snapshot
    Rollback {
        #[command(flatten)]
        table: TableArgs,

        #[arg(long)]
        snapshot: Option<u64>,

        #[arg(long)]
        as_of: Option<String>,

        #[command(flatten)]
        commit: CommitArgs,
    },
    /// Expire old snapshots and delete files nothing references
    Vacuum {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// An age such as 7d or 12h, or an RFC3339 timestamp
        #[arg(long)]
        older_than: String,

        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(path: Option<&Path>) -> CliResult<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path)
            .await
            .context(LoadConfigSnafu { path }),
        None => Ok(SessionConfig::default()),
    }
}

fn parse_timestamp(input: &str) -> CliResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input)
        .map(|ts| ts.with_timezone(&Utc))
        .context(InvalidTimestampSnafu { input })
}

fn parse_as_of(snapshot: Option<u64>, time: Option<&str>) -> CliResult<Option<AsOf>> {
    let time = time.map(parse_timestamp).transpose()?;
    if snapshot.is_none() && time.is_none() {
        return Ok(None);
    }
    Ok(Some(AsOf::from_parts(snapshot, time)?))
}

fn require_as_of(snapshot: Option<u64>, time: Option<&str>) -> CliResult<AsOf> {
    let time = time.map(parse_timestamp).transpose()?;
    Ok(AsOf::from_parts(snapshot, time)?)
}

fn catalog_target(catalog_name: &str, table: &str) -> CliResult<CatalogTarget> {
    let (schema, table) = table.split_once('.').unwrap_or((DEFAULT_SCHEMA, table));
    Ok(CatalogTarget::new(catalog_name, schema, table)?)
}

fn folder_target(dataset: &str) -> CliResult<FolderTarget> {
    let Some((section, name)) = dataset.split_once('/') else {
        return InvalidTargetSnafu {
            message: format!("--dataset {dataset:?} must be SECTION/DATASET"),
        }
        .fail();
    };
    Ok(FolderTarget::new(section, name)?)
}

impl CatalogArgs {
    fn connect(&self, config: SessionConfig) -> Session {
        let mut session = Session::new(config);
        session.connect_catalog(&self.catalog, &self.catalog_name);
        session
    }
}

impl TableArgs {
    fn connect(&self, config: SessionConfig) -> CliResult<(Session, CatalogTarget)> {
        let target = catalog_target(&self.catalog.catalog_name, &self.table)?;
        Ok((self.catalog.connect(config), target))
    }
}

impl TargetArgs {
    fn connect(&self, config: SessionConfig) -> CliResult<(Session, WriteTarget)> {
        let mut session = Session::new(config);
        let target = match (&self.folder, &self.catalog) {
            (Some(base), None) => {
                let dataset = self.dataset.as_deref().ok_or_else(|| {
                    InvalidTargetSnafu {
                        message: "--folder needs --dataset SECTION/DATASET",
                    }
                    .build()
                })?;
                session.connect_folder(base);
                WriteTarget::from(folder_target(dataset)?)
            }
            (None, Some(root)) => {
                let table = self.table.as_deref().ok_or_else(|| {
                    InvalidTargetSnafu {
                        message: "--catalog needs --table",
                    }
                    .build()
                })?;
                session.connect_catalog(root, &self.catalog_name);
                WriteTarget::from(catalog_target(&self.catalog_name, table)?)
            }
            _ => {
                return InvalidTargetSnafu {
                    message: "pass exactly one of --folder or --catalog",
                }
                .fail();
            }
        };
        Ok((session, target))
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_write(
    config: SessionConfig,
    target: TargetArgs,
    input: &Path,
    mode: WriteMode,
    partition_by: Vec<String>,
    filename_pattern: Option<String>,
    commit: CommitArgs,
    dry_run: bool,
) -> CliResult<()> {
    let (session, target) = target.connect(config)?;
    let rows = input::read_rows(input)?;
    let mut request = WriteRequest::new(target, rows, mode).commit_info(commit.into_info());
    if !partition_by.is_empty() {
        request = request.partition_by(partition_by);
    }
    if let Some(pattern) = filename_pattern {
        request = request.filename_pattern(FilenamePattern::new(pattern)?);
    }

    if dry_run {
        println!("{}", session.preview_write(&request).await?);
        return Ok(());
    }
    let outcome = session.write(request).await?;
    println!("{}", render::write_outcome(&outcome));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_upsert(
    config: SessionConfig,
    table: TableArgs,
    input: &Path,
    by: Vec<String>,
    update_cols: Vec<String>,
    insert_only: bool,
    strict: bool,
    commit: CommitArgs,
    dry_run: bool,
) -> CliResult<()> {
    let (session, target) = table.connect(config)?;
    let rows = input::read_rows(input)?;
    let mut request = UpsertRequest::new(target, rows, by)
        .strict(strict)
        .commit_info(commit.into_info());
    if insert_only {
        request = request.update_cols(Vec::<String>::new());
    } else if !update_cols.is_empty() {
        request = request.update_cols(update_cols);
    }

    if dry_run {
        println!("{}", session.preview_upsert(&request).await?);
        return Ok(());
    }
    let outcome = session.upsert(request).await?;
    println!(
        "Upserted {}: {} inserted, {} updated (snapshot {})",
        outcome.table, outcome.inserted, outcome.updated, outcome.snapshot.snapshot_id
    );
    Ok(())
}

async fn cmd_set_partitioning(
    config: SessionConfig,
    table: TableArgs,
    partition_by: Vec<String>,
    clear: bool,
    commit: CommitArgs,
) -> CliResult<()> {
    let (session, target) = table.connect(config)?;
    let spec = (!clear).then_some(partition_by.as_slice());
    let snapshot = session
        .set_partitioning(&target, spec, commit.into_info())
        .await?;
    match spec {
        Some(spec) => println!(
            "Partitioned {target} by {} (snapshot {})",
            spec.join(", "),
            snapshot.snapshot_id
        ),
        None => println!(
            "Removed partitioning of {target} (snapshot {})",
            snapshot.snapshot_id
        ),
    }
    Ok(())
}

async fn cmd_show(
    config: SessionConfig,
    target: TargetArgs,
    snapshot: Option<u64>,
    as_of: Option<String>,
    schema: bool,
    max_rows: usize,
) -> CliResult<()> {
    let (session, target) = target.connect(config)?;
    let relation = match (parse_as_of(snapshot, as_of.as_deref())?, &target) {
        (None, _) => session.read(&target).await?,
        (Some(as_of), WriteTarget::Catalog(table)) => session.read_as_of(table, &as_of).await?,
        (Some(_), WriteTarget::Folder(_)) => {
            return InvalidTargetSnafu {
                message: "--snapshot and --as-of need a catalog table",
            }
            .fail();
        }
    };
    debug!(relation = %target, files = relation.file_count(), "resolved relation");

    if schema {
        let columns = lakefold_core::schema::ColumnSchema::list(&relation.schema());
        println!("{}", render::columns(&columns));
        return Ok(());
    }
    let batch = relation.collect_batch().await?;
    println!("{}", render::rows(&batch, max_rows)?);
    Ok(())
}

async fn cmd_snapshots(config: SessionConfig, catalog: CatalogArgs) -> CliResult<()> {
    let session = catalog.connect(config);
    let snapshots = session.list_snapshots(&catalog.catalog_name).await?;
    println!("{}", render::snapshots(&snapshots));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_diff(
    config: SessionConfig,
    table: TableArgs,
    from_snapshot: Option<u64>,
    from_time: Option<String>,
    to_snapshot: Option<u64>,
    to_time: Option<String>,
    keys: Vec<String>,
    max_rows: usize,
) -> CliResult<()> {
    let (session, target) = table.connect(config)?;
    let from = require_as_of(from_snapshot, from_time.as_deref())?;
    let to = parse_as_of(to_snapshot, to_time.as_deref())?;
    let keys = (!keys.is_empty()).then_some(keys.as_slice());
    let diff = session.diff(&target, &from, to.as_ref(), keys).await?;
    println!("{}", render::diff(&diff, max_rows)?);
    Ok(())
}

async fn cmd_rollback(
    config: SessionConfig,
    table: TableArgs,
    snapshot: Option<u64>,
    as_of: Option<String>,
    commit: CommitArgs,
) -> CliResult<()> {
    let (session, target) = table.connect(config)?;
    let to = require_as_of(snapshot, as_of.as_deref())?;
    let restored = session.rollback(&target, &to, commit.into_info()).await?;
    println!(
        "Rolled back {target} to {to} (snapshot {})",
        restored.snapshot_id
    );
    Ok(())
}

async fn cmd_vacuum(
    config: SessionConfig,
    catalog: CatalogArgs,
    older_than: &str,
    dry_run: bool,
) -> CliResult<()> {
    let cutoff: RetentionCutoff = older_than.parse().context(InvalidRetentionSnafu)?;
    let session = catalog.connect(config);
    let report = session.vacuum(&cutoff, dry_run).await?;
    println!("{}", render::vacuum(&report));
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;
    match cli.cmd {
        Command::Write {
            target,
            input,
            mode,
            partition_by,
            filename_pattern,
            commit,
            dry_run,
        } => {
            cmd_write(
                config,
                target,
                &input,
                mode,
                partition_by,
                filename_pattern,
                commit,
                dry_run,
            )
            .await
        }
        Command::Upsert {
            table,
            input,
            by,
            update_cols,
            insert_only,
            strict,
            commit,
            dry_run,
        } => {
            cmd_upsert(
                config,
                table,
                &input,
                by,
                update_cols,
                insert_only,
                strict,
                commit,
                dry_run,
            )
            .await
        }
        Command::SetPartitioning {
            table,
            partition_by,
            clear,
            commit,
        } => cmd_set_partitioning(config, table, partition_by, clear, commit).await,
        Command::Show {
            target,
            snapshot,
            as_of,
            schema,
            max_rows,
        } => cmd_show(config, target, snapshot, as_of, schema, max_rows).await,
        Command::Snapshots { catalog } => cmd_snapshots(config, catalog).await,
        Command::Diff {
            table,
            from_snapshot,
            from_time,
            to_snapshot,
            to_time,
            keys,
            max_rows,
        } => {
            cmd_diff(
                config,
                table,
                from_snapshot,
                from_time,
                to_snapshot,
                to_time,
                keys,
                max_rows,
            )
            .await
        }
        Command::Rollback {
            table,
            snapshot,
            as_of,
            commit,
        } => cmd_rollback(config, table, snapshot, as_of, commit).await,
        Command::Vacuum {
            catalog,
            older_than,
            dry_run,
        } => cmd_vacuum(config, catalog, &older_than, dry_run).await,
    }
}

fn report(err: &CliError) {
    eprintln!("{err}");
    if let Some(hint) = err.hint() {
        eprintln!("hint: {hint}");
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        report(&e);
        std::process::exit(1);
    }
}

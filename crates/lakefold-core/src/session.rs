//! The caller-owned session: one attached backend and every public operation.
//!
//! A [`Session`] starts disconnected. Attaching a backend replaces whatever
//! was attached before, and every operation checks the attached variant
//! before it validates or touches anything else.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info, instrument};

use crate::{
    catalog::{Catalog, CatalogAction, Snapshot},
    error::{
        EngineResult, InvalidConfigSnafu, NotConnectedSnafu, StorageSnafu, TargetNotFoundSnafu,
        UnknownCatalogSnafu, WrongBackendModeSnafu,
    },
    folder::FolderStore,
    governance::GovernanceRules,
    history::{AsOf, RetentionCutoff, TableDiff, VacuumReport},
    partition::PartitionSpec,
    plan::{self, CatalogPlan, FolderAction, TargetState, WritePlan},
    preview::{self, RowSetSummary, UpsertPreview, WritePreview},
    relation::Relation,
    request::{CommitInfo, Compression, UpsertRequest, WriteRequest},
    rowset,
    schema::{ColumnSchema, SchemaDelta},
    scratch::ScratchSpace,
    storage::{self, StorageLocation},
    target::{CatalogTarget, FolderTarget, WriteTarget},
};

/// The two storage backends a session can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain folder-partitioned Parquet datasets.
    Folder,
    /// Versioned catalog with snapshots.
    Catalog,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Folder => f.write_str("folder"),
            BackendKind::Catalog => f.write_str("catalog"),
        }
    }
}

/// Session-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Required partition specs for folder datasets.
    pub governance: GovernanceRules,
    /// Codec for every data file written.
    pub compression: Compression,
    /// Author recorded on commits that do not name one.
    pub default_author: Option<String>,
}

impl SessionConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text).context(InvalidConfigSnafu)
    }

    /// Read a JSON configuration file.
    pub async fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let file = path.file_name().map(Path::new).unwrap_or(path);
        let text = storage::read_to_string(&StorageLocation::local(dir), file)
            .await
            .context(StorageSnafu)?;
        Self::from_json(&text)
    }
}

/// Where a write landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLocation {
    /// Dataset directory of a folder write.
    Path(PathBuf),
    /// `catalog.schema.table` of a catalog write.
    Table(String),
}

impl fmt::Display for WriteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteLocation::Path(p) => write!(f, "{}", p.display()),
            WriteLocation::Table(name) => f.write_str(name),
        }
    }
}

/// Result of [`Session::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The dataset path or qualified table name.
    pub location: WriteLocation,
    /// `false` when an `IgnoreIfExists` write found the dataset present.
    pub written: bool,
    /// Data files created by the write.
    pub files_written: usize,
    /// Snapshot committed by a catalog write.
    pub snapshot: Option<Snapshot>,
}

/// Result of [`Session::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// `catalog.schema.table`.
    pub table: String,
    /// The committed snapshot.
    pub snapshot: Snapshot,
    /// Incoming rows added as new rows.
    pub inserted: u64,
    /// Existing rows whose update columns were overwritten.
    pub updated: u64,
}

#[derive(Debug)]
enum Backend {
    Folder(FolderStore),
    Catalog(Catalog),
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Folder(_) => BackendKind::Folder,
            Backend::Catalog(_) => BackendKind::Catalog,
        }
    }
}

/// A caller-owned handle to one attached backend.
#[derive(Debug, Default)]
pub struct Session {
    config: SessionConfig,
    backend: Option<Backend>,
    scratch: ScratchSpace,
}

impl Session {
    /// A disconnected session.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            backend: None,
            scratch: ScratchSpace::new(),
        }
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Temporary row sets registered by in-flight operations.
    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Which backend is attached, if any.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(Backend::kind)
    }

    /// Attach the folder backend rooted at `base`, replacing any previous backend.
    pub fn connect_folder(&mut self, base: impl Into<PathBuf>) {
        self.disconnect();
        let store = FolderStore::new(base, self.config.compression);
        info!(base = %store.location().root().display(), "attached folder backend");
        self.backend = Some(Backend::Folder(store));
    }

    /// Attach the catalog at `root` under `name`, replacing any previous backend.
    pub fn connect_catalog(&mut self, root: impl Into<PathBuf>, name: impl Into<String>) {
        self.disconnect();
        let catalog = Catalog::open(name, root, self.config.compression);
        info!(
            catalog = %catalog.name(),
            root = %catalog.location().root().display(),
            "attached catalog backend"
        );
        self.backend = Some(Backend::Catalog(catalog));
    }

    /// Detach the current backend.
    pub fn disconnect(&mut self) {
        if let Some(previous) = self.backend.take() {
            debug!(backend = %previous.kind(), "detached backend");
        }
    }

    fn attached(&self, operation: &'static str) -> EngineResult<&Backend> {
        self.backend
            .as_ref()
            .context(NotConnectedSnafu { operation })
    }

    fn folder(&self, operation: &'static str) -> EngineResult<&FolderStore> {
        match self.attached(operation)? {
            Backend::Folder(store) => Ok(store),
            other => WrongBackendModeSnafu {
                operation,
                expected: BackendKind::Folder,
                actual: other.kind(),
            }
            .fail(),
        }
    }

    fn catalog(&self, operation: &'static str) -> EngineResult<&Catalog> {
        match self.attached(operation)? {
            Backend::Catalog(catalog) => Ok(catalog),
            other => WrongBackendModeSnafu {
                operation,
                expected: BackendKind::Catalog,
                actual: other.kind(),
            }
            .fail(),
        }
    }

    fn catalog_named(&self, operation: &'static str, name: &str) -> EngineResult<&Catalog> {
        let catalog = self.catalog(operation)?;
        ensure!(
            catalog.name() == name,
            UnknownCatalogSnafu {
                requested: name,
                attached: catalog.name(),
            }
        );
        Ok(catalog)
    }

    fn catalog_for(&self, operation: &'static str, target: &CatalogTarget) -> EngineResult<&Catalog> {
        let catalog = self.catalog_named(operation, &target.catalog)?;
        target.validate()?;
        Ok(catalog)
    }

    fn folder_for(&self, operation: &'static str, target: &FolderTarget) -> EngineResult<&FolderStore> {
        let store = self.folder(operation)?;
        target.validate()?;
        Ok(store)
    }

    fn commit_info(&self, mut info: CommitInfo) -> CommitInfo {
        if info.author.is_none() {
            info.author.clone_from(&self.config.default_author);
        }
        info
    }

    async fn catalog_target_state(catalog: &Catalog, target: &CatalogTarget) -> EngineResult<TargetState> {
        Ok(match catalog.table_state(&target.table_ref()).await? {
            Some(table) => TargetState {
                exists: true,
                schema: Some(table.meta.schema.to_arrow()),
                partition_by: table.meta.partition_by,
            },
            None => TargetState::missing(),
        })
    }

    async fn target_state(&self, operation: &'static str, target: &WriteTarget) -> EngineResult<TargetState> {
        match target {
            WriteTarget::Folder(t) => self.folder_for(operation, t)?.target_state(t).await,
            WriteTarget::Catalog(t) => {
                let catalog = self.catalog_for(operation, t)?;
                Self::catalog_target_state(catalog, t).await
            }
        }
    }

    /// Write rows to a folder dataset or a catalog table.
    #[instrument(skip_all, fields(target = %request.target, mode = %request.mode))]
    pub async fn write(&self, request: WriteRequest) -> EngineResult<WriteOutcome> {
        const OP: &str = "write";
        let state = self.target_state(OP, &request.target).await?;
        match plan::plan_write(&request, &state, &self.config.governance)? {
            WritePlan::Folder(plan) => {
                let store = self.folder(OP)?;
                let report = store.execute(&plan, &request.rows).await?;
                Ok(WriteOutcome {
                    location: WriteLocation::Path(store.location().join(&plan.target.rel_dir())),
                    written: !report.skipped,
                    files_written: report.files_written.len(),
                    snapshot: None,
                })
            }
            WritePlan::Catalog(plan) => {
                let catalog = self.catalog(OP)?;
                let commit = catalog
                    .execute_write(&plan, &request.rows, self.commit_info(request.commit))
                    .await?;
                let files_written = commit
                    .actions
                    .iter()
                    .filter(|a| matches!(a, CatalogAction::AddFile { .. }))
                    .count();
                info!(snapshot = commit.version, files = files_written, "committed write");
                Ok(WriteOutcome {
                    location: WriteLocation::Table(format!("{}.{}", catalog.name(), plan.table())),
                    written: true,
                    files_written,
                    snapshot: Some(Snapshot::from(&commit)),
                })
            }
        }
    }

    /// Merge rows into a catalog table by key.
    #[instrument(skip_all, fields(target = %request.target))]
    pub async fn upsert(&self, request: UpsertRequest) -> EngineResult<UpsertOutcome> {
        const OP: &str = "upsert";
        let catalog = self.catalog_for(OP, &request.target)?;
        let state = Self::catalog_target_state(catalog, &request.target).await?;
        let plan = plan::plan_upsert(&request, &state)?;
        if request.strict {
            plan.ensure_unique_keys()?;
        }

        let staged = self.scratch.register("upsert", request.rows);
        let (commit, counts) = catalog
            .execute_upsert(&plan, staged.rows(), self.commit_info(request.commit))
            .await?;
        info!(
            snapshot = commit.version,
            inserted = counts.inserted,
            updated = counts.updated,
            "committed upsert"
        );
        Ok(UpsertOutcome {
            table: request.target.qualified_name(),
            snapshot: Snapshot::from(&commit),
            inserted: counts.inserted,
            updated: counts.updated,
        })
    }

    /// Change the partitioning of a catalog table's future writes.
    ///
    /// `None` removes partitioning. Existing files keep their layout.
    pub async fn set_partitioning(
        &self,
        target: &CatalogTarget,
        partition_by: Option<&[String]>,
        commit: CommitInfo,
    ) -> EngineResult<Snapshot> {
        let catalog = self.catalog_for("set partitioning", target)?;
        let spec = partition_by.map(PartitionSpec::parse).transpose()?;
        let commit = catalog
            .execute_set_partitioning(&target.table_ref(), spec, self.commit_info(commit))
            .await?;
        info!(table = %target, snapshot = commit.version, "changed partitioning");
        Ok(Snapshot::from(&commit))
    }

    /// Current contents of a dataset or table.
    pub async fn read(&self, target: &WriteTarget) -> EngineResult<Relation> {
        const OP: &str = "read";
        match target {
            WriteTarget::Folder(t) => self.folder_for(OP, t)?.relation(t).await,
            WriteTarget::Catalog(t) => {
                let catalog = self.catalog_for(OP, t)?;
                let table = catalog
                    .table_state(&t.table_ref())
                    .await?
                    .context(TargetNotFoundSnafu {
                        target: t.qualified_name(),
                    })?;
                Ok(catalog.relation_for(&table))
            }
        }
    }

    /// Column names and types of a dataset or table.
    pub async fn describe(&self, target: &WriteTarget) -> EngineResult<Vec<ColumnSchema>> {
        match target {
            WriteTarget::Folder(t) => self.folder_for("describe", t)?.describe(t).await,
            WriteTarget::Catalog(_) => Ok(ColumnSchema::list(&self.read(target).await?.schema())),
        }
    }

    /// A catalog table as of a past snapshot.
    pub async fn read_as_of(&self, target: &CatalogTarget, as_of: &AsOf) -> EngineResult<Relation> {
        self.catalog_for("read as of", target)?
            .read_table_at(&target.table_ref(), as_of)
            .await
    }

    /// Retained snapshots of the attached catalog, oldest first.
    pub async fn list_snapshots(&self, catalog: &str) -> EngineResult<Vec<Snapshot>> {
        self.catalog_named("list snapshots", catalog)?
            .snapshots()
            .await
    }

    /// Rows added and removed between two snapshots of a table.
    ///
    /// `to` defaults to the current snapshot. With `key_cols`, rows whose key
    /// appears on both sides are reported as modified.
    pub async fn diff(
        &self,
        target: &CatalogTarget,
        from: &AsOf,
        to: Option<&AsOf>,
        key_cols: Option<&[String]>,
    ) -> EngineResult<TableDiff> {
        self.catalog_for("diff", target)?
            .diff(&target.table_ref(), from, to, key_cols)
            .await
    }

    /// Restore a table to its contents at `to`, committing a new snapshot.
    pub async fn rollback(
        &self,
        target: &CatalogTarget,
        to: &AsOf,
        commit: CommitInfo,
    ) -> EngineResult<Snapshot> {
        let commit = self
            .catalog_for("rollback", target)?
            .rollback(&target.table_ref(), to, self.commit_info(commit))
            .await?;
        Ok(Snapshot::from(&commit))
    }

    /// Expire snapshots older than `cutoff` and reclaim unreferenced files.
    ///
    /// With `dry_run`, the same candidates are computed and nothing changes.
    pub async fn vacuum(&self, cutoff: &RetentionCutoff, dry_run: bool) -> EngineResult<VacuumReport> {
        self.catalog("vacuum")?
            .vacuum(cutoff.resolve(Utc::now()), dry_run)
            .await
    }

    /// Describe what [`Session::write`] would do without writing.
    pub async fn preview_write(&self, request: &WriteRequest) -> EngineResult<WritePreview> {
        const OP: &str = "preview write";
        let state = self.target_state(OP, &request.target).await?;
        let plan = plan::plan_write(request, &state, &self.config.governance)?;

        let staged = self.scratch.register("preview_write", request.rows.clone());
        let rows = staged.rows();
        let incoming = RowSetSummary::of_batch(rows);

        let mut preview = WritePreview {
            target: request.target.clone(),
            mode: request.mode,
            plan: plan.clone(),
            incoming,
            existing: None,
            schema_delta: None,
            partition_by: None,
            partitions: Vec::new(),
            existing_partitions: Vec::new(),
            partitions_to_replace: Vec::new(),
        };

        if state.exists {
            let relation = self.read(&request.target).await?;
            preview.existing = Some(RowSetSummary::of_relation(&relation).await?);
            preview.schema_delta = state
                .schema
                .as_ref()
                .map(|existing| SchemaDelta::between(existing, &rows.schema()));
        }

        match &plan {
            WritePlan::Folder(p) => {
                preview.partition_by = p.partition_by.clone();
                preview.partitions = p.partitions.clone();
                if state.exists {
                    preview.existing_partitions = self
                        .folder(OP)?
                        .existing_partitions(&p.target, &p.partitions)
                        .await?;
                }
                if matches!(p.action, FolderAction::ReplacePartitions { .. }) {
                    preview
                        .partitions_to_replace
                        .clone_from(&preview.existing_partitions);
                }
            }
            WritePlan::Catalog(CatalogPlan::CreateOrReplace {
                partition_by,
                partitions,
                ..
            }) => {
                preview.partition_by = partition_by.clone();
                preview.partitions = partitions.clone();
            }
            WritePlan::Catalog(CatalogPlan::Append { partitions, .. }) => {
                preview.partition_by = state.partition_by.clone();
                preview.partitions = partitions.clone();
            }
        }
        Ok(preview)
    }

    /// Describe what [`Session::upsert`] would do without writing.
    ///
    /// Duplicate incoming keys are reported, never rejected.
    pub async fn preview_upsert(&self, request: &UpsertRequest) -> EngineResult<UpsertPreview> {
        let catalog = self.catalog_for("preview upsert", &request.target)?;
        let state = Self::catalog_target_state(catalog, &request.target).await?;
        let plan = plan::plan_upsert(request, &state)?;
        let table = catalog
            .table_state(&plan.table)
            .await?
            .context(TargetNotFoundSnafu {
                target: request.target.qualified_name(),
            })?;
        let table_schema = table.meta.schema.to_arrow();

        let staged = self.scratch.register("preview_upsert", request.rows.clone());
        let rows = staged.rows();
        let relation = catalog.relation_for(&table);
        let existing_rows = relation.collect_batch().await?;
        let incoming = rowset::conform(rows, &table_schema, &plan.table.to_string())?;
        let (would_insert, would_update) =
            preview::upsert_counts(&plan, &table_schema, &incoming, &existing_rows)?;

        Ok(UpsertPreview {
            incoming: RowSetSummary::of_batch(rows),
            existing: RowSetSummary {
                rows: existing_rows.num_rows() as u64,
                columns: ColumnSchema::list(&table_schema),
            },
            schema_delta: SchemaDelta::between(&table_schema, &rows.schema()),
            would_insert,
            would_update,
            duplicate_keys: plan.duplicates.clone(),
            plan,
        })
    }
}

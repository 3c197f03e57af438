//! Write targets and identifier validation.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{EngineResult, InvalidIdentifierSnafu};

/// A dataset in the folder backend: `<base_path>/<section>/<dataset>/`.
///
/// The base path belongs to the session the target is written through.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FolderTarget {
    /// Top-level grouping folder.
    pub section: String,
    /// Dataset folder inside the section.
    pub dataset: String,
}

impl FolderTarget {
    /// Build a target, validating both names.
    pub fn new(section: impl Into<String>, dataset: impl Into<String>) -> EngineResult<Self> {
        let target = Self {
            section: section.into(),
            dataset: dataset.into(),
        };
        target.validate()?;
        Ok(target)
    }

    /// Re-check the names, for targets built with struct literals.
    pub fn validate(&self) -> EngineResult<()> {
        validate_path_name("section", &self.section)?;
        validate_path_name("dataset", &self.dataset)
    }

    /// Dataset directory relative to the base path.
    pub fn rel_dir(&self) -> PathBuf {
        PathBuf::from(&self.section).join(&self.dataset)
    }
}

impl fmt::Display for FolderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.section, self.dataset)
    }
}

/// A table in the catalog backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CatalogTarget {
    /// Catalog the session is attached to.
    pub catalog: String,
    /// Schema (namespace) inside the catalog.
    pub schema: String,
    /// Table name.
    pub table: String,
}

impl CatalogTarget {
    /// Build a target, validating all three names.
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> EngineResult<Self> {
        let target = Self {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        };
        target.validate()?;
        Ok(target)
    }

    /// Re-check the names, for targets built with struct literals.
    pub fn validate(&self) -> EngineResult<()> {
        validate_sql_name("catalog", &self.catalog)?;
        validate_sql_name("schema", &self.schema)?;
        validate_sql_name("table", &self.table)
    }

    /// The catalog-local table reference.
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            schema: self.schema.clone(),
            table: self.table.clone(),
        }
    }

    /// `catalog.schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

impl fmt::Display for CatalogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Where a write request lands.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    /// Folder-partitioned dataset.
    Folder(FolderTarget),
    /// Versioned catalog table.
    Catalog(CatalogTarget),
}

impl WriteTarget {
    /// Validate the identifiers of whichever variant this is.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            WriteTarget::Folder(t) => t.validate(),
            WriteTarget::Catalog(t) => t.validate(),
        }
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Folder(t) => t.fmt(f),
            WriteTarget::Catalog(t) => t.fmt(f),
        }
    }
}

impl From<FolderTarget> for WriteTarget {
    fn from(t: FolderTarget) -> Self {
        WriteTarget::Folder(t)
    }
}

impl From<CatalogTarget> for WriteTarget {
    fn from(t: CatalogTarget) -> Self {
        WriteTarget::Catalog(t)
    }
}

/// A table inside the attached catalog, as recorded in the log.
///
/// Serialized as `"schema.table"` so it can key JSON maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableRef {
    /// Schema name.
    pub schema: String,
    /// Table name.
    pub table: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl From<TableRef> for String {
    fn from(t: TableRef) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for TableRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => Ok(TableRef {
                schema: schema.to_string(),
                table: table.to_string(),
            }),
            _ => Err(format!("invalid table reference {value:?}")),
        }
    }
}

/// Folder names: `[A-Za-z0-9_-]+`, not starting with `.`.
fn validate_path_name(kind: &'static str, value: &str) -> EngineResult<()> {
    ensure!(
        !value.is_empty(),
        InvalidIdentifierSnafu {
            kind,
            value,
            reason: "must not be empty",
        }
    );
    ensure!(
        value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        InvalidIdentifierSnafu {
            kind,
            value,
            reason: "only ASCII letters, digits, '_' and '-' are allowed",
        }
    );
    Ok(())
}

/// Catalog names: `[A-Za-z_][A-Za-z0-9_]*`.
fn validate_sql_name(kind: &'static str, value: &str) -> EngineResult<()> {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return InvalidIdentifierSnafu {
            kind,
            value,
            reason: "must not be empty",
        }
        .fail();
    };
    ensure!(
        first.is_ascii_alphabetic() || first == '_',
        InvalidIdentifierSnafu {
            kind,
            value,
            reason: "must start with an ASCII letter or '_'",
        }
    );
    ensure!(
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        InvalidIdentifierSnafu {
            kind,
            value,
            reason: "only ASCII letters, digits and '_' are allowed",
        }
    );
    Ok(())
}

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use snafu::{Backtrace, IntoError, prelude::*};

/// The filesystem step a storage error comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageOp {
    /// Reading a data, log or config file.
    Read,
    /// Writing a file in place or under create-new semantics.
    Write,
    /// Creating the parent directories of a file.
    CreateDir,
    /// Moving a staged pointer file over its target.
    Rename,
    /// Deleting a file or a partition directory.
    Remove,
    /// Walking a dataset or data directory.
    List,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            StorageOp::Read => "read",
            StorageOp::Write => "write",
            StorageOp::CreateDir => "create directory",
            StorageOp::Rename => "rename onto",
            StorageOp::Remove => "remove",
            StorageOp::List => "list",
        };
        f.write_str(verb)
    }
}

/// A failed filesystem step, with the absolute path it touched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// Nothing exists at the path.
    #[snafu(display("Cannot {op} {}: no such file or directory", path.display()))]
    Missing {
        /// Step that failed.
        op: StorageOp,
        /// Absolute path of the file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
        /// Captured where the error was classified.
        backtrace: Backtrace,
    },

    /// A create-new write found its name taken, usually by a concurrent writer.
    #[snafu(display("Cannot {op} {}: the file already exists", path.display()))]
    Occupied {
        /// Step that failed.
        op: StorageOp,
        /// Absolute path of the file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
        /// Captured where the error was classified.
        backtrace: Backtrace,
    },

    /// Any other filesystem failure.
    #[snafu(display("Cannot {op} {}: {source}", path.display()))]
    Filesystem {
        /// Step that failed.
        op: StorageOp,
        /// Absolute path of the file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
        /// Captured where the error was classified.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Classify an I/O failure of `op` at `path`.
    pub(crate) fn from_io(op: StorageOp, path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => MissingSnafu { op, path }.into_error(err),
            io::ErrorKind::AlreadyExists => OccupiedSnafu { op, path }.into_error(err),
            _ => FilesystemSnafu { op, path }.into_error(err),
        }
    }

    /// Whether the failure was a missing file or directory.
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::Missing { .. })
    }

    /// The absolute path the failed step touched.
    pub fn path(&self) -> &Path {
        match self {
            StorageError::Missing { path, .. }
            | StorageError::Occupied { path, .. }
            | StorageError::Filesystem { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_step_and_path() {
        let err = StorageError::from_io(
            StorageOp::Remove,
            Path::new("/lake/sales/orders/year=2024"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, StorageError::Filesystem { op: StorageOp::Remove, .. }));
        assert!(
            err.to_string()
                .starts_with("Cannot remove /lake/sales/orders/year=2024: ")
        );
        assert_eq!(err.path(), Path::new("/lake/sales/orders/year=2024"));
        assert!(!err.is_missing());
    }
}

//! Filesystem access for dataset folders and catalog roots.
//!
//! Every physical read or write performed by the engine goes through the
//! helpers in this module. Callers address files by a [`StorageLocation`]
//! (the root) plus a relative path, which keeps path conventions in the
//! `folder` and `catalog` modules and leaves this module focused on:
//!
//! - Atomic replacement (write-then-rename) for small pointer files such as
//!   `CURRENT`.
//! - Create-new writes for commit and data files, so a name is produced
//!   exactly once.
//! - Recursive listing and best-effort removal of files and directories.
//!
//! Only the local filesystem is supported today.

mod error;

pub use error::{StorageError, StorageOp};

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::warn;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of a storage area: a dataset base path or a catalog root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// The root directory of this location.
    pub fn root(&self) -> &Path {
        match self {
            StorageLocation::Local(root) => root,
        }
    }

    /// Resolve a relative path against the root.
    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root().join(rel)
    }
}

/// Adapter for `map_err` that tags an I/O failure with its step and path.
fn failed(op: StorageOp, path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |err| StorageError::from_io(op, path, err)
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(failed(StorageOp::CreateDir, parent))?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = remove_file_blocking(&self.path) {
            warn!(error = %e, "failed to remove temporary file");
        }
    }
}

/// Remove the file at absolute path `abs` without awaiting, for `Drop` impls.
/// A missing file is not an error; returns whether a file was removed.
pub(crate) fn remove_file_blocking(abs: &Path) -> StorageResult<bool> {
    match std::fs::remove_file(abs) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::from_io(StorageOp::Remove, abs, e)),
    }
}

/// Write `contents` to `rel_path` using write-then-rename.
///
/// The payload lands in a sibling `.tmp` file, is synced, and is then
/// renamed over the target so readers never observe a partial file.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(failed(StorageOp::Write, &tmp_path))?;
        file.write_all(contents)
            .await
            .map_err(failed(StorageOp::Write, &tmp_path))?;
        file.sync_all()
            .await
            .map_err(failed(StorageOp::Write, &tmp_path))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(failed(StorageOp::Rename, &abs))?;
    guard.disarm();

    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::Occupied`] if the file is already there.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(failed(StorageOp::Write, &abs))?;

    file.write_all(contents)
        .await
        .map_err(failed(StorageOp::Write, &abs))?;
    file.sync_all()
        .await
        .map_err(failed(StorageOp::Write, &abs))?;

    Ok(())
}

/// Read a UTF-8 file into a `String`.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(failed(StorageOp::Read, &abs))
}

/// Read the full contents of a file.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    fs::read(&abs).await.map_err(failed(StorageOp::Read, &abs))
}

/// Whether anything (file or directory) exists at `rel_path`.
pub async fn exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    let abs = location.join(rel_path);
    fs::try_exists(&abs)
        .await
        .map_err(failed(StorageOp::Read, &abs))
}

/// Remove a file. A missing file is not an error; returns whether a file was
/// actually removed.
pub async fn remove_file_if_exists(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<bool> {
    let abs = location.join(rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::from_io(StorageOp::Remove, &abs, e)),
    }
}

/// Recursively remove a directory. A missing directory is not an error;
/// returns whether anything was removed.
pub async fn remove_dir_all_if_exists(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<bool> {
    let abs = location.join(rel_path);
    match fs::remove_dir_all(&abs).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::from_io(StorageOp::Remove, &abs, e)),
    }
}

/// Recursively list the regular files under `rel_dir` whose extension is
/// `extension`.
///
/// Returned paths are relative to the location root and sorted. A missing
/// directory yields an empty list.
pub async fn list_files(
    location: &StorageLocation,
    rel_dir: &Path,
    extension: &str,
) -> StorageResult<Vec<PathBuf>> {
    let root = location.root();
    let mut pending = vec![location.join(rel_dir)];
    let mut found = Vec::new();

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(StorageError::from_io(StorageOp::List, &dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(failed(StorageOp::List, &dir))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(failed(StorageOp::List, &path))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file()
                && path.extension() == Some(OsStr::new(extension))
                && let Ok(rel) = path.strip_prefix(root)
            {
                found.push(rel.to_path_buf());
            }
        }
    }

    found.sort();
    Ok(found)
}

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::file::FileRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("remote path is empty")]
    EmptyRemotePath,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
}

/// Manages on-device cached bytes. Storage paths are deterministic
/// functions of (owner, space, remote path), so any layer can recompute
/// where a record's bytes live without consulting the record itself.
pub struct LocalStorageProvider {
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Default on-disk location for a record:
    /// `<root>/<owner>[/<space>]/<remote path components>`.
    pub fn default_path(
        &self,
        owner: &str,
        space_id: Option<&str>,
        remote_path: &str,
    ) -> Result<PathBuf, StorageError> {
        if remote_path.is_empty() {
            return Err(StorageError::EmptyRemotePath);
        }

        let mut out = self.root.clone();
        push_component(&mut out, owner)?;
        if let Some(space) = space_id {
            push_component(&mut out, space)?;
        }
        for component in Path::new(remote_path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::UnsupportedComponent);
                }
            }
        }
        Ok(out)
    }

    /// Sibling path implied by keeping the parent and substituting the
    /// final name.
    pub fn renamed_path(&self, storage_path: &Path, new_name: &str) -> PathBuf {
        storage_path.with_file_name(new_name)
    }

    /// Evicts a record's cached bytes. Missing bytes are not an error.
    pub async fn delete_cached_bytes(&self, file: &FileRecord) -> Result<(), StorageError> {
        let path = match &file.storage_path {
            Some(path) => PathBuf::from(path),
            None => self.default_path(
                &file.owner,
                file.space_id.as_deref(),
                &file.remote_path,
            )?,
        };
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return Ok(());
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Relocates cached bytes after a move or rename. A missing source is
    /// a no-op: the record simply had nothing cached.
    pub async fn move_cached_bytes(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        if tokio::fs::metadata(from).await.is_err() {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }
}

fn push_component(out: &mut PathBuf, part: &str) -> Result<(), StorageError> {
    if part.is_empty() || part.contains('/') {
        return Err(StorageError::UnsupportedComponent);
    }
    out.push(part);
    Ok(())
}

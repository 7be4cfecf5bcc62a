use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures_util::Stream;
use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use nimbus_core::{MIME_DIR, RemoteClient, RemoteError, RemoteFile};

use crate::file::{AvailableOffline, FileRecord};
use crate::spaces::{SpaceResolver, SpacesError};
use crate::storage::{LocalStorageProvider, StorageError};
use crate::store::{FileStore, StoreError};

pub const ROOT_PATH: &str = "/";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("space resolution failed: {0}")]
    Spaces(#[from] SpacesError),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("a file already exists at {path}")]
    AlreadyExists { path: String },
    #[error("remote returned an empty listing for {path}")]
    EmptyListing { path: String },
    #[error("file has not been persisted yet: {path}")]
    NotPersisted { path: String },
    #[error("file vanished from the local store: {path}")]
    MissingFile { path: String },
}

/// Orchestrates the remote source, the local metadata store, and the
/// on-disk cache into atomic-looking multi-file operations. Per item, the
/// remote side is always mutated before the local side; failure recovery
/// relies on that ordering.
pub struct FileRepository {
    remote: RemoteClient,
    store: FileStore,
    storage: LocalStorageProvider,
    spaces: SpaceResolver,
}

impl FileRepository {
    pub fn new(
        remote: RemoteClient,
        store: FileStore,
        storage: LocalStorageProvider,
        spaces: SpaceResolver,
    ) -> Self {
        Self {
            remote,
            store,
            storage,
            spaces,
        }
    }

    /// Fetches the current remote listing of a folder and merges it into
    /// the local record set, preserving local-only state. Returns the
    /// merged child set as persisted.
    pub async fn refresh_folder(
        &self,
        remote_path: &str,
        owner: &str,
        space_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, RepoError> {
        let base = self.spaces.base_url_for(owner, space_id).await?;
        let listing = self.remote.list_folder(&base, remote_path).await?;
        let mut entries = Vec::with_capacity(listing.len());
        for remote in &listing {
            entries.push(record_from_remote(remote, owner, space_id)?);
        }
        if entries.is_empty() {
            return Err(RepoError::EmptyListing {
                path: remote_path.to_string(),
            });
        }
        let mut fetched_folder = entries.remove(0);

        let local_folder = self
            .store
            .get_file_by_path(owner, space_id, remote_path)
            .await?;

        let Some(local_folder) = local_folder else {
            // First sync: everything in the listing is new.
            let mut children = entries;
            for child in &mut children {
                child.needs_thumbnail = !child.is_folder();
            }
            let (_, saved) = self.store.save_folder(&fetched_folder, &children).await?;
            return Ok(saved);
        };

        fetched_folder.copy_local_properties_from(&local_folder);
        let folder_id = persisted_id(&fetched_folder)?;
        let parent_pinned = fetched_folder.available_offline.is_pinned();

        let mut lookup: HashMap<String, FileRecord> = self
            .store
            .folder_children(folder_id)
            .await?
            .into_iter()
            .map(|child| (child.sync_key(), child))
            .collect();

        let mut merged = Vec::with_capacity(entries.len());
        for mut child in entries {
            let matched = child
                .remote_id
                .as_ref()
                .and_then(|remote_id| lookup.remove(remote_id.as_str()))
                .or_else(|| lookup.remove(child.remote_path.as_str()));
            match matched {
                None => {
                    child.parent_id = Some(folder_id);
                    child.needs_thumbnail = !child.is_folder();
                    // Content has not been verified locally yet.
                    child.etag.clear();
                    child.available_offline = if parent_pinned {
                        AvailableOffline::Inherited
                    } else {
                        AvailableOffline::NotPinned
                    };
                }
                Some(previous) => {
                    let fresh_modified = child.modified;
                    child.copy_local_properties_from(&previous);
                    // Listings do not guarantee content freshness; only a
                    // content sync may advance the etag.
                    child.etag = previous.etag.clone();
                    child.needs_thumbnail = !child.is_folder()
                        && (previous.needs_thumbnail || fresh_modified != previous.modified);
                    if parent_pinned && previous.available_offline != AvailableOffline::Pinned {
                        child.available_offline = AvailableOffline::Inherited;
                    }
                }
            }
            merged.push(child);
        }

        // Whatever was not consumed no longer exists remotely.
        for stale in lookup.into_values() {
            eprintln!(
                "[nimbus-sync] removing local entry gone remotely: {}",
                stale.remote_path
            );
            if stale.is_folder() {
                self.delete_local_folder_recursively(&stale, false).await?;
            } else {
                self.delete_local_file(&stale, false).await?;
            }
        }

        if merged.iter().all(|child| child.etag_in_conflict.is_none()) {
            fetched_folder.etag_in_conflict = None;
        }

        let (_, saved) = self.store.save_folder(&fetched_folder, &merged).await?;
        Ok(saved)
    }

    /// Creates a folder on the remote side and persists the new record
    /// under `parent`.
    pub async fn create_folder(
        &self,
        parent: &FileRecord,
        name: &str,
    ) -> Result<FileRecord, RepoError> {
        let base = self
            .spaces
            .base_url_for(&parent.owner, parent.space_id.as_deref())
            .await?;
        let path = format!("{}{}/", parent.remote_path, name);
        let created = self.remote.create_folder(&base, &path).await?;
        let mut record = record_from_remote(&created, &parent.owner, parent.space_id.as_deref())?;
        record.parent_id = parent.id;
        if parent.available_offline.is_pinned() {
            record.available_offline = AvailableOffline::Inherited;
        }
        Ok(self.store.save_file(&record).await?)
    }

    /// Copies each source into `target`, independently per item. A vanished
    /// source drops just that item (re-raised only for single-item
    /// batches); a vanished target aborts the whole batch after purging the
    /// target locally.
    pub async fn copy_files(
        &self,
        sources: &[FileRecord],
        target: &FileRecord,
    ) -> Result<Vec<FileRecord>, RepoError> {
        let base = self
            .spaces
            .base_url_for(&target.owner, target.space_id.as_deref())
            .await?;
        let mut created = Vec::new();
        for source in sources {
            let final_path = self.destination_path(&base, source, target).await?;
            match self
                .remote
                .copy_file(&base, &source.remote_path, &final_path)
                .await
            {
                Err(RemoteError::Conflict { .. }) => {
                    self.purge_vanished_target(target).await?;
                    return Err(RemoteError::Conflict {
                        path: target.remote_path.clone(),
                    }
                    .into());
                }
                Err(RemoteError::NotFound { .. }) => {
                    self.drop_vanished_source(source).await?;
                    if sources.len() == 1 {
                        return Err(RemoteError::NotFound {
                            path: source.remote_path.clone(),
                        }
                        .into());
                    }
                }
                Err(err) => return Err(err.into()),
                Ok(remote_id) => {
                    let mut copy = source.clone();
                    copy.id = None;
                    copy.remote_id = remote_id;
                    copy.owner = target.owner.clone();
                    copy.space_id = target.space_id.clone();
                    copy.remote_path = final_path;
                    copy.parent_id = target.id;
                    copy.storage_path = None;
                    copy.etag_in_conflict = None;
                    copy.transfer_id = None;
                    copy.available_offline = if target.available_offline.is_pinned() {
                        AvailableOffline::Inherited
                    } else {
                        AvailableOffline::NotPinned
                    };
                    created.push(self.store.save_file(&copy).await?);
                }
            }
        }
        Ok(created)
    }

    /// Moves each source into `target` with the same per-item failure
    /// policy as [`copy_files`]. A successful move rewrites the subtree's
    /// remote and storage paths, carries any conflict marker across the
    /// relocation, and relocates cached bytes.
    pub async fn move_files(
        &self,
        sources: &[FileRecord],
        target: &FileRecord,
    ) -> Result<Vec<FileRecord>, RepoError> {
        let base = self
            .spaces
            .base_url_for(&target.owner, target.space_id.as_deref())
            .await?;
        let mut moved = Vec::new();
        for source in sources {
            let final_path = self.destination_path(&base, source, target).await?;
            match self
                .remote
                .move_file(&base, &source.remote_path, &final_path)
                .await
            {
                Err(RemoteError::Conflict { .. }) => {
                    self.purge_vanished_target(target).await?;
                    return Err(RemoteError::Conflict {
                        path: target.remote_path.clone(),
                    }
                    .into());
                }
                Err(RemoteError::NotFound { .. }) => {
                    self.drop_vanished_source(source).await?;
                    if sources.len() == 1 {
                        return Err(RemoteError::NotFound {
                            path: source.remote_path.clone(),
                        }
                        .into());
                    }
                }
                Err(err) => return Err(err.into()),
                Ok(remote_id) => {
                    let new_storage = self.storage.default_path(
                        &source.owner,
                        source.space_id.as_deref(),
                        &final_path,
                    )?;
                    let mut record = self
                        .relocate_local(source, &final_path, &new_storage)
                        .await?;
                    record.parent_id = target.id;
                    if let Some(remote_id) = remote_id {
                        record.remote_id = Some(remote_id);
                    }
                    moved.push(self.store.save_file(&record).await?);
                }
            }
        }
        Ok(moved)
    }

    /// Deletes records remotely and locally, or evicts only the local copy.
    /// Directories are removed recursively, children before parents.
    pub async fn delete_files(
        &self,
        files: &[FileRecord],
        only_from_local: bool,
    ) -> Result<(), RepoError> {
        for file in files {
            if !only_from_local {
                let base = self
                    .spaces
                    .base_url_for(&file.owner, file.space_id.as_deref())
                    .await?;
                match self.remote.delete_file(&base, &file.remote_path).await {
                    Ok(()) => {}
                    Err(RemoteError::NotFound { .. }) => {
                        eprintln!(
                            "[nimbus-sync] remote already gone, deleting locally: {}",
                            file.remote_path
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if file.is_folder() {
                self.delete_local_folder_recursively(file, only_from_local)
                    .await?;
            } else {
                self.delete_local_file(file, only_from_local).await?;
            }
        }
        Ok(())
    }

    /// Renames a file in place. Fails with [`RepoError::AlreadyExists`]
    /// before any remote side effect if a sibling already holds the name.
    pub async fn rename_file(
        &self,
        file: &FileRecord,
        new_name: &str,
    ) -> Result<FileRecord, RepoError> {
        let mut new_path = format!("{}{}", file.parent_path(), new_name);
        if file.is_folder() {
            new_path.push('/');
        }
        if self
            .store
            .get_file_by_path(&file.owner, file.space_id.as_deref(), &new_path)
            .await?
            .is_some()
        {
            return Err(RepoError::AlreadyExists { path: new_path });
        }

        let base = self
            .spaces
            .base_url_for(&file.owner, file.space_id.as_deref())
            .await?;
        self.remote
            .move_file(&base, &file.remote_path, &new_path)
            .await?;

        let old_storage = self.storage_path_of(file)?;
        let new_storage = self.storage.renamed_path(&old_storage, new_name);
        self.relocate_local(file, &new_path, &new_storage).await
    }

    pub async fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>, RepoError> {
        Ok(self.store.get_file(id).await?)
    }

    pub async fn file_by_path(
        &self,
        owner: &str,
        space_id: Option<&str>,
        remote_path: &str,
    ) -> Result<Option<FileRecord>, RepoError> {
        Ok(self
            .store
            .get_file_by_path(owner, space_id, remote_path)
            .await?)
    }

    /// Returns the root folder record for an (owner, space) scope,
    /// synthesizing it on first access.
    pub async fn root_folder(
        &self,
        owner: &str,
        space_id: Option<&str>,
    ) -> Result<FileRecord, RepoError> {
        if let Some(existing) = self
            .store
            .get_file_by_path(owner, space_id, ROOT_PATH)
            .await?
        {
            return Ok(existing);
        }
        let root = FileRecord {
            id: None,
            remote_id: None,
            owner: owner.to_string(),
            space_id: space_id.map(str::to_string),
            remote_path: ROOT_PATH.to_string(),
            parent_id: None,
            mime_type: MIME_DIR.to_string(),
            length: 0,
            modified: 0,
            etag: String::new(),
            storage_path: None,
            etag_in_conflict: None,
            available_offline: AvailableOffline::NotPinned,
            needs_thumbnail: false,
            transfer_id: None,
        };
        Ok(self.store.save_file(&root).await?)
    }

    pub async fn folder_content(&self, parent_id: i64) -> Result<Vec<FileRecord>, RepoError> {
        Ok(self.store.folder_children(parent_id).await?)
    }

    /// Continuous folder-content query, re-evaluated whenever the local
    /// store changes.
    pub fn folder_content_stream(
        &self,
        parent_id: i64,
    ) -> impl Stream<Item = Result<Vec<FileRecord>, StoreError>> + use<> {
        self.store.watch_folder(parent_id)
    }

    /// Pins or unpins a record. Pinning a folder marks every descendant
    /// without an explicit pin as inherited; unpinning reverts them.
    pub async fn set_available_offline(
        &self,
        file: &FileRecord,
        status: AvailableOffline,
    ) -> Result<(), RepoError> {
        let id = persisted_id(file)?;
        self.store.set_available_offline(id, status).await?;
        if file.is_folder() {
            let descendants = match status {
                AvailableOffline::NotPinned => AvailableOffline::NotPinned,
                _ => AvailableOffline::Inherited,
            };
            self.store
                .set_available_offline_subtree(
                    &file.owner,
                    file.space_id.as_deref(),
                    &file.remote_path,
                    descendants,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn save_conflict(
        &self,
        file: &FileRecord,
        etag_in_conflict: &str,
    ) -> Result<(), RepoError> {
        let id = persisted_id(file)?;
        Ok(self.store.set_conflict(id, etag_in_conflict).await?)
    }

    pub async fn clean_conflict(&self, file: &FileRecord) -> Result<(), RepoError> {
        let id = persisted_id(file)?;
        Ok(self.store.clear_conflict(id).await?)
    }

    async fn destination_path(
        &self,
        base: &url::Url,
        source: &FileRecord,
        target: &FileRecord,
    ) -> Result<String, RepoError> {
        let mut wanted = format!("{}{}", target.remote_path, source.file_name());
        if source.is_folder() {
            wanted.push('/');
        }
        Ok(self
            .remote
            .resolve_available_path(base, &wanted, source.is_folder())
            .await?)
    }

    /// Rewrites the local record (and, for folders, the whole subtree)
    /// to its post-relocation path, carrying any conflict marker across
    /// the rewrite, then relocates cached bytes.
    async fn relocate_local(
        &self,
        file: &FileRecord,
        new_path: &str,
        new_storage: &Path,
    ) -> Result<FileRecord, RepoError> {
        let id = persisted_id(file)?;
        let old_storage = self.storage_path_of(file)?;
        let new_storage_str = new_storage.display().to_string();

        // The marker is keyed to the record before and after the rewrite;
        // detach it first and reattach once the relocation is persisted.
        let conflict = file.etag_in_conflict.clone();
        if conflict.is_some() {
            self.store.clear_conflict(id).await?;
        }
        self.store
            .move_subtree(
                &file.owner,
                file.space_id.as_deref(),
                &file.remote_path,
                new_path,
                &old_storage.display().to_string(),
                &new_storage_str,
            )
            .await?;
        if let Some(etag) = &conflict {
            self.store.set_conflict(id, etag).await?;
        }

        self.storage
            .move_cached_bytes(&old_storage, new_storage)
            .await?;

        self.store
            .get_file(id)
            .await?
            .ok_or_else(|| RepoError::MissingFile {
                path: new_path.to_string(),
            })
    }

    async fn purge_vanished_target(&self, target: &FileRecord) -> Result<(), RepoError> {
        eprintln!(
            "[nimbus-sync] target folder vanished remotely, purging: {}",
            target.remote_path
        );
        self.delete_local_folder_recursively(target, false).await
    }

    async fn drop_vanished_source(&self, source: &FileRecord) -> Result<(), RepoError> {
        eprintln!(
            "[nimbus-sync] source vanished remotely, dropping: {}",
            source.remote_path
        );
        if source.is_folder() {
            self.delete_local_folder_recursively(source, false).await
        } else {
            self.delete_local_file(source, false).await
        }
    }

    /// Removes a folder from the local store and storage, children before
    /// parents. With `only_from_local` the database rows survive and only
    /// cached bytes and local markers are dropped.
    fn delete_local_folder_recursively<'a>(
        &'a self,
        folder: &'a FileRecord,
        only_from_local: bool,
    ) -> BoxFuture<'a, Result<(), RepoError>> {
        async move {
            let folder_id = persisted_id(folder)?;
            for child in self.store.folder_children(folder_id).await? {
                if child.is_folder() {
                    self.delete_local_folder_recursively(&child, only_from_local)
                        .await?;
                } else {
                    self.delete_local_file(&child, only_from_local).await?;
                }
            }
            self.delete_local_file(folder, only_from_local).await
        }
        .boxed()
    }

    async fn delete_local_file(
        &self,
        file: &FileRecord,
        only_from_local: bool,
    ) -> Result<(), RepoError> {
        let id = persisted_id(file)?;
        if file.etag_in_conflict.is_some() {
            self.store.clear_conflict(id).await?;
        }
        self.storage.delete_cached_bytes(file).await?;
        if only_from_local {
            let mut kept = file.clone();
            kept.storage_path = None;
            kept.etag_in_conflict = None;
            self.store.save_file(&kept).await?;
        } else {
            self.store.delete_file(id).await?;
        }
        Ok(())
    }

    fn storage_path_of(&self, file: &FileRecord) -> Result<PathBuf, RepoError> {
        match &file.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(self.storage.default_path(
                &file.owner,
                file.space_id.as_deref(),
                &file.remote_path,
            )?),
        }
    }
}

fn persisted_id(file: &FileRecord) -> Result<i64, RepoError> {
    file.id.ok_or_else(|| RepoError::NotPersisted {
        path: file.remote_path.clone(),
    })
}

fn record_from_remote(
    remote: &RemoteFile,
    owner: &str,
    space_id: Option<&str>,
) -> Result<FileRecord, RepoError> {
    Ok(FileRecord {
        id: None,
        remote_id: remote.file_id.clone(),
        owner: owner.to_string(),
        space_id: space_id.map(str::to_string),
        remote_path: remote.path.clone(),
        parent_id: None,
        mime_type: remote.mime_type.clone(),
        length: remote.size.unwrap_or(0) as i64,
        modified: parse_modified(remote.modified.as_deref())?.unwrap_or(0),
        etag: remote.etag.clone().unwrap_or_default(),
        storage_path: None,
        etag_in_conflict: None,
        available_offline: AvailableOffline::NotPinned,
        needs_thumbnail: false,
        transfer_id: None,
    })
}

fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

#[cfg(test)]
#[path = "repo_tests.rs"]
mod tests;

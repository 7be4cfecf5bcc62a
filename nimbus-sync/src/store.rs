use futures_util::Stream;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::file::{AvailableOffline, FileRecord};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid available-offline status: {0}")]
    InvalidAvailability(String),
    #[error("file not found after save")]
    MissingFile,
}

/// Persisted mapping from (owner, space, remote path) to file metadata.
/// Every mutation signals the change channel so live folder queries
/// re-evaluate.
#[derive(Clone)]
pub struct FileStore {
    pool: SqlitePool,
    changes: broadcast::Sender<()>,
}

impl FileStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { pool, changes }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, remote_id, owner, space_id, remote_path, parent_id, mime_type, length, modified, etag, storage_path, etag_in_conflict, available_offline, needs_thumbnail, transfer_id
             FROM files WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn get_file_by_path(
        &self,
        owner: &str,
        space_id: Option<&str>,
        remote_path: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, remote_id, owner, space_id, remote_path, parent_id, mime_type, length, modified, etag, storage_path, etag_in_conflict, available_offline, needs_thumbnail, transfer_id
             FROM files
             WHERE owner = ?1 AND IFNULL(space_id, '') = IFNULL(?2, '') AND remote_path = ?3",
        )
        .bind(owner)
        .bind(space_id)
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    pub async fn folder_children(&self, parent_id: i64) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, remote_id, owner, space_id, remote_path, parent_id, mime_type, length, modified, etag, storage_path, etag_in_conflict, available_offline, needs_thumbnail, transfer_id
             FROM files WHERE parent_id = ?1
             ORDER BY remote_path ASC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Inserts or updates one record and returns it as persisted.
    pub async fn save_file(&self, file: &FileRecord) -> Result<FileRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let id = upsert_file(&mut conn, file).await?;
        drop(conn);
        self.notify();
        self.get_file(id).await?.ok_or(StoreError::MissingFile)
    }

    /// Persists a folder entity together with its merged child set as one
    /// unit. Children still carrying `id = None` are inserted, the rest
    /// updated in place.
    pub async fn save_folder(
        &self,
        folder: &FileRecord,
        children: &[FileRecord],
    ) -> Result<(FileRecord, Vec<FileRecord>), StoreError> {
        let mut tx = self.pool.begin().await?;
        let folder_id = upsert_file(&mut tx, folder).await?;
        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            let mut child = child.clone();
            child.parent_id = Some(folder_id);
            child_ids.push(upsert_file(&mut tx, &child).await?);
        }
        tx.commit().await?;
        self.notify();

        let saved_folder = self
            .get_file(folder_id)
            .await?
            .ok_or(StoreError::MissingFile)?;
        let mut saved_children = Vec::with_capacity(child_ids.len());
        for id in child_ids {
            saved_children.push(self.get_file(id).await?.ok_or(StoreError::MissingFile)?);
        }
        Ok((saved_folder, saved_children))
    }

    pub async fn delete_file(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    pub async fn set_conflict(&self, id: i64, etag_in_conflict: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE files SET etag_in_conflict = ?2 WHERE id = ?1")
            .bind(id)
            .bind(etag_in_conflict)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    pub async fn clear_conflict(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE files SET etag_in_conflict = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    pub async fn set_available_offline(
        &self,
        id: i64,
        status: AvailableOffline,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE files SET available_offline = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        self.notify();
        Ok(())
    }

    /// Rewrites the availability of every descendant of `folder_path`,
    /// leaving explicitly pinned records untouched.
    pub async fn set_available_offline_subtree(
        &self,
        owner: &str,
        space_id: Option<&str>,
        folder_path: &str,
        status: AvailableOffline,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE files SET available_offline = ?4
             WHERE owner = ?1 AND IFNULL(space_id, '') = IFNULL(?2, '')
               AND remote_path LIKE ?3 || '%' AND remote_path <> ?3
               AND available_offline <> 'pinned'",
        )
        .bind(owner)
        .bind(space_id)
        .bind(folder_path)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        self.notify();
        Ok(())
    }

    /// Rewrites remote paths and storage paths after a move or rename.
    /// Folder paths carry their trailing slash, so the prefix rewrite covers
    /// the whole subtree; file paths are rewritten exactly.
    pub async fn move_subtree(
        &self,
        owner: &str,
        space_id: Option<&str>,
        old_path: &str,
        new_path: &str,
        old_storage: &str,
        new_storage: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if old_path.ends_with('/') {
            sqlx::query(
                "UPDATE files SET remote_path = ?4 || substr(remote_path, length(?3) + 1)
                 WHERE owner = ?1 AND IFNULL(space_id, '') = IFNULL(?2, '')
                   AND (remote_path = ?3 OR remote_path LIKE ?3 || '%')",
            )
            .bind(owner)
            .bind(space_id)
            .bind(old_path)
            .bind(new_path)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE files SET storage_path = ?4 || substr(storage_path, length(?3) + 1)
                 WHERE owner = ?1 AND IFNULL(space_id, '') = IFNULL(?2, '')
                   AND storage_path IS NOT NULL
                   AND (storage_path = ?3 OR storage_path LIKE ?3 || '/%')",
            )
            .bind(owner)
            .bind(space_id)
            .bind(old_storage)
            .bind(new_storage)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE files SET remote_path = ?4,
                        storage_path = CASE WHEN storage_path IS NULL THEN NULL ELSE ?5 END
                 WHERE owner = ?1 AND IFNULL(space_id, '') = IFNULL(?2, '')
                   AND remote_path = ?3",
            )
            .bind(owner)
            .bind(space_id)
            .bind(old_path)
            .bind(new_path)
            .bind(new_storage)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.notify();
        Ok(())
    }

    pub async fn register_account(&self, owner: &str, base_url: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (owner, base_url) VALUES (?1, ?2)
             ON CONFLICT(owner) DO UPDATE SET base_url = excluded.base_url",
        )
        .bind(owner)
        .bind(base_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn register_space(
        &self,
        owner: &str,
        space_id: &str,
        base_url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO spaces (owner, space_id, base_url) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner, space_id) DO UPDATE SET base_url = excluded.base_url",
        )
        .bind(owner)
        .bind(space_id)
        .bind(base_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn account_base_url(&self, owner: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT base_url FROM accounts WHERE owner = ?1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("base_url").map_err(StoreError::from))
            .transpose()
    }

    pub async fn space_base_url(
        &self,
        owner: &str,
        space_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT base_url FROM spaces WHERE owner = ?1 AND space_id = ?2")
            .bind(owner)
            .bind(space_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("base_url").map_err(StoreError::from))
            .transpose()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    /// Live folder-content query: yields the current children immediately
    /// and a fresh snapshot after every store change.
    pub fn watch_folder(
        &self,
        parent_id: i64,
    ) -> impl Stream<Item = Result<Vec<FileRecord>, StoreError>> + use<> {
        let store = self.clone();
        let rx = self.changes.subscribe();
        futures_util::stream::unfold(
            (store, rx, true),
            move |(store, mut rx, first)| async move {
                if !first {
                    loop {
                        match rx.recv().await {
                            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
                let snapshot = store.folder_children(parent_id).await;
                Some((snapshot, (store, rx, false)))
            },
        )
    }

    fn notify(&self) {
        let _ = self.changes.send(());
    }
}

async fn upsert_file(conn: &mut SqliteConnection, file: &FileRecord) -> Result<i64, StoreError> {
    if let Some(id) = file.id {
        sqlx::query(
            "UPDATE files SET
                remote_id = ?2,
                owner = ?3,
                space_id = ?4,
                remote_path = ?5,
                parent_id = ?6,
                mime_type = ?7,
                length = ?8,
                modified = ?9,
                etag = ?10,
                storage_path = ?11,
                etag_in_conflict = ?12,
                available_offline = ?13,
                needs_thumbnail = ?14,
                transfer_id = ?15
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&file.remote_id)
        .bind(&file.owner)
        .bind(&file.space_id)
        .bind(&file.remote_path)
        .bind(file.parent_id)
        .bind(&file.mime_type)
        .bind(file.length)
        .bind(file.modified)
        .bind(&file.etag)
        .bind(&file.storage_path)
        .bind(&file.etag_in_conflict)
        .bind(file.available_offline.as_str())
        .bind(if file.needs_thumbnail { 1 } else { 0 })
        .bind(&file.transfer_id)
        .execute(conn)
        .await?;
        Ok(id)
    } else {
        let result = sqlx::query(
            "INSERT INTO files (
                remote_id, owner, space_id, remote_path, parent_id, mime_type,
                length, modified, etag, storage_path, etag_in_conflict,
                available_offline, needs_thumbnail, transfer_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&file.remote_id)
        .bind(&file.owner)
        .bind(&file.space_id)
        .bind(&file.remote_path)
        .bind(file.parent_id)
        .bind(&file.mime_type)
        .bind(file.length)
        .bind(file.modified)
        .bind(&file.etag)
        .bind(&file.storage_path)
        .bind(&file.etag_in_conflict)
        .bind(file.available_offline.as_str())
        .bind(if file.needs_thumbnail { 1 } else { 0 })
        .bind(&file.transfer_id)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, StoreError> {
    let availability: String = row.try_get("available_offline")?;
    let needs_thumbnail: i64 = row.try_get("needs_thumbnail")?;
    Ok(FileRecord {
        id: Some(row.try_get("id")?),
        remote_id: row.try_get("remote_id")?,
        owner: row.try_get("owner")?,
        space_id: row.try_get("space_id")?,
        remote_path: row.try_get("remote_path")?,
        parent_id: row.try_get("parent_id")?,
        mime_type: row.try_get("mime_type")?,
        length: row.try_get("length")?,
        modified: row.try_get("modified")?,
        etag: row.try_get("etag")?,
        storage_path: row.try_get("storage_path")?,
        etag_in_conflict: row.try_get("etag_in_conflict")?,
        available_offline: AvailableOffline::parse(&availability)
            .ok_or(StoreError::InvalidAvailability(availability))?,
        needs_thumbnail: needs_thumbnail != 0,
        transfer_id: row.try_get("transfer_id")?,
    })
}

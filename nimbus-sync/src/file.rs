pub use nimbus_core::MIME_DIR;

/// Availability of a file for offline use. `Inherited` marks records whose
/// pin comes from an ancestor folder rather than an explicit user choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailableOffline {
    NotPinned,
    Pinned,
    Inherited,
}

impl AvailableOffline {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AvailableOffline::NotPinned => "not_pinned",
            AvailableOffline::Pinned => "pinned",
            AvailableOffline::Inherited => "inherited",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "not_pinned" => Some(AvailableOffline::NotPinned),
            "pinned" => Some(AvailableOffline::Pinned),
            "inherited" => Some(AvailableOffline::Inherited),
            _ => None,
        }
    }

    pub fn is_pinned(&self) -> bool {
        !matches!(self, AvailableOffline::NotPinned)
    }
}

/// One file or folder as persisted locally. Remote-sourced fields are
/// refreshed on every reconciliation; the local-only fields (storage path,
/// conflict marker, offline pin, thumbnail flag, transfer id) survive it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    /// Surrogate id, assigned on first persistence.
    pub id: Option<i64>,
    /// Server-assigned id; absent until the item has round-tripped.
    pub remote_id: Option<String>,
    pub owner: String,
    /// `None` for legacy single-space accounts.
    pub space_id: Option<String>,
    /// Slash-separated; a trailing slash marks a directory.
    pub remote_path: String,
    pub parent_id: Option<i64>,
    pub mime_type: String,
    pub length: i64,
    pub modified: i64,
    /// Content version tag; empty until content has been verified locally.
    pub etag: String,
    pub storage_path: Option<String>,
    pub etag_in_conflict: Option<String>,
    pub available_offline: AvailableOffline,
    pub needs_thumbnail: bool,
    pub transfer_id: Option<String>,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_DIR
    }

    pub fn file_name(&self) -> &str {
        let trimmed = self.remote_path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((_, name)) if !name.is_empty() => name,
            _ => "/",
        }
    }

    /// Parent folder path, with its trailing slash.
    pub fn parent_path(&self) -> String {
        let trimmed = self.remote_path.trim_end_matches('/');
        match trimmed.rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => format!("{parent}/"),
            _ => "/".to_string(),
        }
    }

    /// Best available identity for reconciliation: the server id when the
    /// item has one, the remote path otherwise.
    pub fn sync_key(&self) -> String {
        self.remote_id
            .clone()
            .unwrap_or_else(|| self.remote_path.clone())
    }

    /// Carries the local-only state of `other` onto freshly fetched remote
    /// metadata. The etag is deliberately not copied here; callers decide
    /// whether the old one must be retained.
    pub fn copy_local_properties_from(&mut self, other: &FileRecord) {
        self.id = other.id;
        self.parent_id = other.parent_id;
        self.storage_path = other.storage_path.clone();
        self.etag_in_conflict = other.etag_in_conflict.clone();
        self.available_offline = other.available_offline;
        self.transfer_id = other.transfer_id.clone();
    }
}

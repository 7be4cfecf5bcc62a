use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Mime sentinel the server uses for directories.
pub const MIME_DIR: &str = "DIR";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("remote item not found: {path}")]
    NotFound { path: String },
    #[error("remote conflict on {path}")]
    Conflict { path: String },
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Client for the file endpoints of one server. Every call takes the
/// space-scoped base URL, since a single account may span several spaces
/// with distinct endpoints.
#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    token: String,
}

impl RemoteClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            token: token.into(),
        }
    }

    /// Fetches a folder listing. The first element is the folder's own
    /// metadata, the remainder its direct children.
    pub async fn list_folder(
        &self,
        base: &Url,
        path: &str,
    ) -> Result<Vec<RemoteFile>, RemoteError> {
        let mut url = Self::endpoint(base, "v1/files")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("depth", "1");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ResourceResponse = Self::handle_response(response, path).await?;
        let mut items = vec![payload.file];
        if let Some(embedded) = payload.embedded {
            items.extend(embedded.items);
        }
        Ok(items)
    }

    pub async fn read_file(&self, base: &Url, path: &str) -> Result<RemoteFile, RemoteError> {
        let mut url = Self::endpoint(base, "v1/files")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ResourceResponse = Self::handle_response(response, path).await?;
        Ok(payload.file)
    }

    pub async fn create_folder(&self, base: &Url, path: &str) -> Result<RemoteFile, RemoteError> {
        let mut url = Self::endpoint(base, "v1/files/folder")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response, path).await
    }

    /// Copies `from` to `to`; returns the id the server assigned to the copy.
    pub async fn copy_file(
        &self,
        base: &Url,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, RemoteError> {
        self.transfer(base, "v1/files/copy", from, to).await
    }

    /// Moves (or renames) `from` to `to`.
    pub async fn move_file(
        &self,
        base: &Url,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, RemoteError> {
        self.transfer(base, "v1/files/move", from, to).await
    }

    pub async fn delete_file(&self, base: &Url, path: &str) -> Result<(), RemoteError> {
        let mut url = Self::endpoint(base, "v1/files")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::error_for(response, path).await)
    }

    pub async fn path_exists(&self, base: &Url, path: &str) -> Result<bool, RemoteError> {
        match self.read_file(base, path).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Probes the server for a collision-free variant of `candidate`,
    /// suffixing " (2)", " (3)", ... before the extension until a free
    /// path is found.
    pub async fn resolve_available_path(
        &self,
        base: &Url,
        candidate: &str,
        is_folder: bool,
    ) -> Result<String, RemoteError> {
        if !self.path_exists(base, candidate).await? {
            return Ok(candidate.to_string());
        }

        let trimmed = candidate.trim_end_matches('/');
        let (dir, name) = match trimmed.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", trimmed),
        };

        let mut attempt = 2u32;
        loop {
            let next = if is_folder {
                format!("{dir}/{name} ({attempt})/")
            } else if let Some((stem, ext)) = name.rsplit_once('.').filter(|(s, _)| !s.is_empty()) {
                format!("{dir}/{stem} ({attempt}).{ext}")
            } else {
                format!("{dir}/{name} ({attempt})")
            };
            if !self.path_exists(base, &next).await? {
                return Ok(next);
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn transfer(
        &self,
        base: &Url,
        endpoint: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<String>, RemoteError> {
        let mut url = Self::endpoint(base, endpoint)?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", to);
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: FileId = Self::handle_response(response, from).await?;
        Ok(payload.file_id)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(base: &Url, path: &str) -> Result<Url, RemoteError> {
        Ok(base.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        path: &str,
    ) -> Result<T, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::error_for(response, path).await)
        }
    }

    async fn error_for(response: reqwest::Response, path: &str) -> RemoteError {
        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => RemoteError::NotFound {
                path: path.to_string(),
            },
            StatusCode::CONFLICT => RemoteError::Conflict {
                path: path.to_string(),
            },
            _ => {
                let body = response.text().await.unwrap_or_default();
                RemoteError::Api { status, body }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFile {
    #[serde(default)]
    pub file_id: Option<String>,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == MIME_DIR
    }
}

#[derive(Debug, Deserialize)]
struct ResourceResponse {
    #[serde(flatten)]
    file: RemoteFile,
    #[serde(rename = "_embedded", default)]
    embedded: Option<EmbeddedItems>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedItems {
    items: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct FileId {
    #[serde(default)]
    file_id: Option<String>,
}

use thiserror::Error;
use url::Url;

use crate::store::{FileStore, StoreError};

#[derive(Debug, Error)]
pub enum SpacesError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("no account registered for {owner}")]
    UnknownAccount { owner: String },
    #[error("no space {space_id} registered for {owner}")]
    UnknownSpace { owner: String, space_id: String },
}

/// Maps an (owner, space id) pair to the space-scoped remote base URL.
/// A `None` space id marks a legacy single-space account and resolves to
/// the account's own base URL.
pub struct SpaceResolver {
    store: FileStore,
}

impl SpaceResolver {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }

    pub async fn base_url_for(
        &self,
        owner: &str,
        space_id: Option<&str>,
    ) -> Result<Url, SpacesError> {
        let raw = match space_id {
            Some(space_id) => self
                .store
                .space_base_url(owner, space_id)
                .await?
                .ok_or_else(|| SpacesError::UnknownSpace {
                    owner: owner.to_string(),
                    space_id: space_id.to_string(),
                })?,
            None => self.store.account_base_url(owner).await?.ok_or_else(|| {
                SpacesError::UnknownAccount {
                    owner: owner.to_string(),
                }
            })?,
        };
        Ok(Url::parse(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn make_resolver() -> SpaceResolver {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = FileStore::from_pool(pool);
        store.init().await.unwrap();
        store
            .register_account("alice@server", "https://legacy.example/")
            .await
            .unwrap();
        store
            .register_space("alice@server", "space-1", "https://spaces.example/s1/")
            .await
            .unwrap();
        SpaceResolver::new(store)
    }

    #[tokio::test]
    async fn legacy_account_resolves_to_account_url() {
        let resolver = make_resolver().await;
        let url = resolver.base_url_for("alice@server", None).await.unwrap();
        assert_eq!(url.as_str(), "https://legacy.example/");
    }

    #[tokio::test]
    async fn space_resolves_to_space_url() {
        let resolver = make_resolver().await;
        let url = resolver
            .base_url_for("alice@server", Some("space-1"))
            .await
            .unwrap();
        assert_eq!(url.as_str(), "https://spaces.example/s1/");
    }

    #[tokio::test]
    async fn unknown_space_is_an_error() {
        let resolver = make_resolver().await;
        let err = resolver
            .base_url_for("alice@server", Some("space-9"))
            .await
            .expect_err("expected unknown space");
        assert!(matches!(err, SpacesError::UnknownSpace { .. }));
    }

    #[tokio::test]
    async fn unknown_account_is_an_error() {
        let resolver = make_resolver().await;
        let err = resolver
            .base_url_for("bob@server", None)
            .await
            .expect_err("expected unknown account");
        assert!(matches!(err, SpacesError::UnknownAccount { .. }));
    }
}

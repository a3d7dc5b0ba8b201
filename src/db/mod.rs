//! Database module: view models and SQL repositories.
//!
//! - `model`: view models returned by listing queries.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! `SqliteStore` adapts the repository functions to the `Store` trait used by
//! the reload coordinator.

pub mod model;
pub mod repo;

pub use model::NewsSummary;
pub use repo::*;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ConditionalGet, Feed, Guid, NewsState};
use crate::store::{ChangeSet, Committed, Store};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_feed_by_link(&self, link: &str) -> Result<Option<Feed>, StoreError> {
        repo::load_feed_by_link(&self.pool, link).await
    }

    async fn find_equivalent_news(
        &self,
        guid: Option<&Guid>,
        link: Option<&str>,
        exclude_feed_link: &str,
    ) -> Result<Option<NewsState>, StoreError> {
        repo::find_equivalent_news(&self.pool, guid, link, exclude_feed_link).await
    }

    async fn conditional_get(&self, link: &str) -> Result<Option<ConditionalGet>, StoreError> {
        repo::get_conditional_get(&self.pool, link).await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<Committed, StoreError> {
        repo::commit_changes(&self.pool, changes).await
    }

    async fn record_reload_status(
        &self,
        bookmark_id: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        repo::record_reload_status(&self.pool, bookmark_id, error).await
    }
}

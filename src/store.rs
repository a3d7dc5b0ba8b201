//! Persistence seam used by the reload coordinator.
use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ConditionalGet, Feed, Guid, News, NewsState, RetentionSettings};

/// Conditional GET record change staged with a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalGetChange {
    Upsert(ConditionalGet),
    Delete,
}

/// Conditions re-checked against the stored row before a removal is applied.
/// A News that gained a flag or label after the feed was loaded is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalGuard {
    pub keep_flagged: bool,
    pub keep_labeled: bool,
    pub keep_unread: bool,
}

impl From<&RetentionSettings> for RemovalGuard {
    fn from(settings: &RetentionSettings) -> Self {
        Self {
            keep_flagged: settings.keep_flagged,
            keep_labeled: settings.keep_labeled,
            keep_unread: settings.keep_unread,
        }
    }
}

/// Everything one reload wants to write, applied atomically.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Feed header (`news` is ignored); inserted when `id` is `None`.
    pub feed: Feed,
    pub write_feed: bool,
    /// Inserted when `id` is `None`, updated otherwise.
    pub upserted: Vec<News>,
    /// Persisted News to tombstone, subject to `removal_guard`.
    pub removed: Vec<News>,
    pub removal_guard: RemovalGuard,
    pub conditional_get: Option<ConditionalGetChange>,
}

impl ChangeSet {
    pub fn has_writes(&self) -> bool {
        self.write_feed
            || !self.upserted.is_empty()
            || !self.removed.is_empty()
            || self.conditional_get.is_some()
    }
}

/// What a successful commit wrote, with store-assigned ids filled in.
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub feed_id: Option<i64>,
    pub inserted: Vec<News>,
    pub updated: Vec<News>,
    /// Only the News actually tombstoned.
    pub removed: Vec<News>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fully materialized feed, News in insertion order.
    async fn load_feed_by_link(&self, link: &str) -> Result<Option<Feed>, StoreError>;

    /// State of the most recently modified News equivalent to the given keys,
    /// anywhere except `exclude_feed_link`.
    async fn find_equivalent_news(
        &self,
        guid: Option<&Guid>,
        link: Option<&str>,
        exclude_feed_link: &str,
    ) -> Result<Option<NewsState>, StoreError>;

    async fn conditional_get(&self, link: &str) -> Result<Option<ConditionalGet>, StoreError>;

    /// All or nothing.
    async fn commit(&self, changes: ChangeSet) -> Result<Committed, StoreError>;

    /// `error == None` records a successful reload.
    async fn record_reload_status(
        &self,
        bookmark_id: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

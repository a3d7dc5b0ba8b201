//! Reload coordinator: fetch, parse, merge, retain and commit one feed as a
//! single unit, then publish what changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::connection::{Fetched, Fetcher};
use crate::error::{FetchError, ReloadError};
use crate::events::{EventSink, NewsEvent};
use crate::interpreter::Interpreter;
use crate::merge::{self, MergeResult};
use crate::model::{Bookmark, ConditionalGet, Feed, NewsState, RetentionSettings};
use crate::retention;
use crate::store::{ChangeSet, ConditionalGetChange, RemovalGuard, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    Fetching,
    Parsing,
    Merging,
    Retaining,
    Committing,
    Done,
}

impl ReloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadPhase::Fetching => "fetching",
            ReloadPhase::Parsing => "parsing",
            ReloadPhase::Merging => "merging",
            ReloadPhase::Retaining => "retaining",
            ReloadPhase::Committing => "committing",
            ReloadPhase::Done => "done",
        }
    }
}

impl fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts of what a committed reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub feed_updated: bool,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        !self.feed_updated && self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The server confirmed the stored validators; nothing was written.
    NotModified,
    /// The caller may configure credentials and retry.
    AuthRequired { link: String, realm: Option<String> },
    Done(ReloadSummary),
}

pub struct FeedReloadCoordinator {
    fetcher: Arc<dyn Fetcher>,
    interpreter: Arc<dyn Interpreter>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    retention_defaults: RetentionSettings,
    fetch_timeout: Duration,
    workers: usize,
    shutdown: watch::Receiver<bool>,
    feed_locks: FeedLocks,
    store_lock: RwLock<()>,
}

impl fmt::Debug for FeedReloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedReloadCoordinator")
            .field("retention_defaults", &self.retention_defaults)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl FeedReloadCoordinator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        interpreter: Arc<dyn Interpreter>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        retention_defaults: RetentionSettings,
    ) -> Self {
        // a receiver whose sender is gone never signals shutdown
        let (_, shutdown) = watch::channel(false);
        Self {
            fetcher,
            interpreter,
            store,
            events,
            retention_defaults,
            fetch_timeout: Duration::from_secs(30),
            workers: 4,
            shutdown,
            feed_locks: FeedLocks::default(),
            store_lock: RwLock::new(()),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Fetches in flight abort once `true` is sent on the channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// One full cycle for `bookmark`. The bookmark's status is recorded
    /// afterwards unless the server answered not-modified, which writes nothing.
    #[instrument(skip_all, fields(bookmark = bookmark.id, link = %bookmark.feed_link))]
    pub async fn reload(&self, bookmark: &Bookmark) -> Result<ReloadOutcome, ReloadError> {
        let result = self.run_cycle(bookmark).await;
        let status = match &result {
            Ok(ReloadOutcome::NotModified) => None,
            Ok(ReloadOutcome::AuthRequired { link, .. }) => {
                Some(Some(format!("authentication required for {}", link)))
            }
            Ok(ReloadOutcome::Done(_)) => Some(None),
            Err(err) => Some(Some(err.to_string())),
        };
        if let Some(status) = status {
            if let Err(err) = self
                .store
                .record_reload_status(bookmark.id, status.as_deref())
                .await
            {
                warn!(error = %err, "failed to record reload status");
            }
        }
        match &result {
            Ok(ReloadOutcome::NotModified) => debug!("feed not modified"),
            Ok(ReloadOutcome::AuthRequired { realm, .. }) => {
                info!(realm = ?realm, "feed requires authentication")
            }
            Ok(ReloadOutcome::Done(summary)) => debug!(?summary, "reload finished"),
            Err(err) => warn!(error = %err, "reload failed"),
        }
        result
    }

    /// Reloads every bookmark, at most `workers` at a time.
    pub async fn reload_all(
        &self,
        bookmarks: &[Bookmark],
    ) -> Vec<(i64, Result<ReloadOutcome, ReloadError>)> {
        stream::iter(bookmarks)
            .map(|bookmark| async move { (bookmark.id, self.reload(bookmark).await) })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }

    /// Applies the bookmark's retention policy without fetching, e.g. after
    /// its settings were tightened. Returns how many News were removed.
    #[instrument(skip_all, fields(bookmark = bookmark.id, link = %bookmark.feed_link))]
    pub async fn enforce_retention(&self, bookmark: &Bookmark) -> Result<usize, ReloadError> {
        let link = bookmark.feed_link.as_str();
        let lease = self.feed_locks.acquire(link).await;

        let Some(feed) = self.store.load_feed_by_link(link).await? else {
            return Ok(0);
        };
        let settings = bookmark.retention.resolve(&self.retention_defaults);
        let doomed = retention::apply_forced(&settings, &feed);
        if doomed.is_empty() {
            return Ok(0);
        }

        let changes = ChangeSet {
            feed: header_of(&feed),
            write_feed: false,
            upserted: Vec::new(),
            removed: doomed.iter().map(|&idx| feed.news[idx].clone()).collect(),
            removal_guard: RemovalGuard::from(&settings),
            conditional_get: None,
        };
        let committed = {
            let _write = self.store_lock.write().await;
            self.store.commit(changes).await?
        };
        drop(lease);

        let removed = committed.removed.len();
        if removed == 0 {
            return Ok(0);
        }
        self.events.notify(&NewsEvent {
            feed_link: link.to_string(),
            feed_updated: false,
            added: Vec::new(),
            updated: Vec::new(),
            removed: committed.removed,
            structural_change: true,
        });
        info!(removed, "retention enforced");
        Ok(removed)
    }

    async fn run_cycle(&self, bookmark: &Bookmark) -> Result<ReloadOutcome, ReloadError> {
        let link = bookmark.feed_link.as_str();

        enter(ReloadPhase::Fetching);
        let stored = self.store.conditional_get(link).await?.unwrap_or_default();
        let fetched = match self.fetch(link, &stored).await {
            Ok(fetched) => fetched,
            Err(FetchError::NotModified) => return Ok(ReloadOutcome::NotModified),
            Err(FetchError::AuthRequired { link, realm }) => {
                return Ok(ReloadOutcome::AuthRequired { link, realm })
            }
            Err(err) => return Err(err.into()),
        };
        if *self.shutdown.borrow() {
            return Err(FetchError::Cancelled.into());
        }

        enter(ReloadPhase::Parsing);
        let mut incoming = self.interpreter.parse(link, &fetched.bytes)?;
        incoming.link = link.to_string();

        let lease = self.feed_locks.acquire(link).await;

        enter(ReloadPhase::Merging);
        let persisted = self.store.load_feed_by_link(link).await?;
        let is_new_feed = persisted.is_none();
        let mut feed = persisted.unwrap_or_else(|| Feed::new(link));
        let seed = self.seed_states(&feed, &incoming).await?;
        let mut result = merge::merge(&mut feed, incoming, &seed);

        enter(ReloadPhase::Retaining);
        let settings = bookmark.retention.resolve(&self.retention_defaults);
        let doomed = retention::apply(&settings, &feed, result.new_count);
        let stillborn = absorb_retention(&mut feed, &mut result, doomed);

        enter(ReloadPhase::Committing);
        let changes = ChangeSet {
            feed: header_of(&feed),
            write_feed: is_new_feed || result.feed_updated,
            upserted: result
                .added
                .iter()
                .chain(result.updated.iter())
                .chain(stillborn.iter())
                .map(|&idx| feed.news[idx].clone())
                .collect(),
            removed: result
                .removed
                .iter()
                .map(|&idx| feed.news[idx].clone())
                .collect(),
            removal_guard: RemovalGuard::from(&settings),
            conditional_get: conditional_change(&stored, &fetched),
        };
        if !changes.has_writes() {
            enter(ReloadPhase::Done);
            return Ok(ReloadOutcome::Done(ReloadSummary::default()));
        }

        let committed = {
            let _write = self.store_lock.write().await;
            self.store.commit(changes).await?
        };
        drop(lease);

        let event = NewsEvent {
            feed_link: link.to_string(),
            feed_updated: result.feed_updated,
            added: committed
                .inserted
                .into_iter()
                .filter(|news| news.is_visible())
                .collect(),
            updated: committed.updated,
            removed: committed.removed,
            structural_change: result.structural_change,
        };
        let summary = ReloadSummary {
            feed_updated: event.feed_updated,
            added: event.added.len(),
            updated: event.updated.len(),
            removed: event.removed.len(),
        };
        if !event.is_empty() {
            self.events.notify(&event);
        }

        enter(ReloadPhase::Done);
        Ok(ReloadOutcome::Done(summary))
    }

    async fn fetch(&self, link: &str, conditional: &ConditionalGet) -> Result<Fetched, FetchError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            res = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(link, conditional)) => {
                res.map_err(|_| FetchError::Timeout)?
            }
            _ = wait_for_shutdown(&mut shutdown) => Err(FetchError::Cancelled),
        }
    }

    /// States of equivalent News elsewhere in the store, keyed by position in
    /// `incoming.news`, for items the persisted feed does not know yet.
    async fn seed_states(
        &self,
        persisted: &Feed,
        incoming: &Feed,
    ) -> Result<HashMap<usize, NewsState>, ReloadError> {
        let unmatched = merge::unmatched_indices(persisted, incoming);
        let mut seed = HashMap::new();
        if unmatched.is_empty() {
            return Ok(seed);
        }
        let _read = self.store_lock.read().await;
        for idx in unmatched {
            let news = &incoming.news[idx];
            if let Some(state) = self
                .store
                .find_equivalent_news(news.guid.as_ref(), news.link.as_deref(), &incoming.link)
                .await?
            {
                seed.insert(idx, state);
            }
        }
        Ok(seed)
    }
}

/// Per-link mutexes. An entry lives only while some cycle holds or waits
/// for it.
#[derive(Default)]
struct FeedLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FeedLocks {
    async fn acquire(&self, link: &str) -> FeedLease<'_> {
        let lock = {
            let mut locks = self.locks();
            locks.entry(link.to_string()).or_default().clone()
        };
        FeedLease {
            locks: self,
            link: link.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks().len()
    }
}

struct FeedLease<'a> {
    locks: &'a FeedLocks,
    link: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FeedLease<'_> {
    fn drop(&mut self) {
        // releases our clone of the Arc; clones are only taken under the map
        // lock, so a count of one means nobody else is waiting
        self.guard.take();
        let mut locks = self.locks.locks();
        if locks
            .get(&self.link)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.link);
        }
    }
}

fn enter(phase: ReloadPhase) {
    debug!(%phase, "reload phase");
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn header_of(feed: &Feed) -> Feed {
    Feed {
        news: Vec::new(),
        ..feed.clone()
    }
}

/// Folds retention decisions into the merge result. Items that arrived in
/// this very cycle are stored directly as tombstones so the next fetch does
/// not add them again; their positions are returned.
fn absorb_retention(feed: &mut Feed, result: &mut MergeResult, doomed: Vec<usize>) -> Vec<usize> {
    let mut stillborn = Vec::new();
    let mut persisted = Vec::new();
    for idx in doomed {
        if result.added.contains(&idx) {
            result.added.retain(|&a| a != idx);
            feed.news[idx].hide();
            stillborn.push(idx);
        } else {
            persisted.push(idx);
        }
    }
    result.absorb_removals(persisted);
    stillborn
}

/// New validators replace the stored ones; a response without validators
/// clears them.
fn conditional_change(stored: &ConditionalGet, fetched: &Fetched) -> Option<ConditionalGetChange> {
    if fetched.conditional == *stored {
        None
    } else if fetched.conditional.is_empty() {
        Some(ConditionalGetChange::Delete)
    } else {
        Some(ConditionalGetChange::Upsert(fetched.conditional.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::News;

    #[test]
    fn conditional_change_only_when_validators_differ() {
        let stored = ConditionalGet {
            if_modified_since: None,
            if_none_match: Some("\"a\"".into()),
        };
        let same = Fetched {
            bytes: vec![],
            conditional: stored.clone(),
        };
        assert_eq!(conditional_change(&stored, &same), None);

        let cleared = Fetched {
            bytes: vec![],
            conditional: ConditionalGet::default(),
        };
        assert_eq!(
            conditional_change(&stored, &cleared),
            Some(ConditionalGetChange::Delete)
        );
        assert_eq!(conditional_change(&ConditionalGet::default(), &cleared), None);
    }

    #[test]
    fn retention_of_fresh_items_leaves_tombstones() {
        let mut feed = Feed::new("http://example.com/feed");
        let mut old = News::new("old").with_link("http://example.com/old");
        old.id = Some(1);
        old.state = NewsState::Read;
        feed.news.push(old);
        feed.news.push(News::new("fresh").with_link("http://example.com/fresh"));
        let mut result = MergeResult {
            added: vec![1],
            structural_change: true,
            new_count: 1,
            ..Default::default()
        };

        let stillborn = absorb_retention(&mut feed, &mut result, vec![0, 1]);
        assert_eq!(stillborn, vec![1]);
        assert_eq!(feed.news[1].state, NewsState::Hidden);
        assert!(result.added.is_empty());
        assert_eq!(result.removed, vec![0]);
        assert!(result.structural_change);
    }

    #[tokio::test]
    async fn feed_locks_are_dropped_once_released() {
        let locks = FeedLocks::default();
        let first = locks.acquire("http://a/feed").await;
        let other = locks.acquire("http://b/feed").await;
        assert_eq!(locks.len(), 2);

        let waiting = {
            let locks = &locks;
            async move { locks.acquire("http://a/feed").await }
        };
        tokio::pin!(waiting);
        // registers the waiter, which cannot get the lock yet
        assert!(futures::poll!(waiting.as_mut()).is_pending());
        drop(first);
        assert_eq!(locks.len(), 2);

        let second = waiting.await;
        drop(second);
        drop(other);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_wait_returns_once_signalled() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

use super::model::NewsSummary;
use crate::error::StoreError;
use crate::model::{
    Attachment, Bookmark, Category, ConditionalGet, Feed, Guid, Image, News, NewsBin, NewsState,
    Person, RetentionOverrides, Source,
};
use crate::store::{ChangeSet, Committed, ConditionalGetChange, RemovalGuard};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    // every in-memory connection is its own database
    let max_connections = if normalized.starts_with("sqlite::memory") {
        1
    } else {
        8
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// feeds and news
// ---------------------------------------------------------------------------

fn parse_json_map(raw: &str) -> Result<BTreeMap<String, String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn feed_from_row(row: &SqliteRow) -> Result<Feed, StoreError> {
    let image = Image {
        url: row.try_get("image_url")?,
        title: row.try_get("image_title")?,
        link: row.try_get("image_link")?,
    };
    let properties: String = row.try_get("properties")?;
    Ok(Feed {
        id: Some(row.try_get("id")?),
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        homepage: row.try_get("homepage")?,
        format: row.try_get("format")?,
        language: row.try_get("language")?,
        copyright: row.try_get("copyright")?,
        generator: row.try_get("generator")?,
        published_at: row.try_get("published_at")?,
        last_build_at: row.try_get("last_build_at")?,
        image: (image != Image::default()).then_some(image),
        properties: parse_json_map(&properties)?,
        news: Vec::new(),
    })
}

fn news_from_row(row: &SqliteRow) -> Result<News, StoreError> {
    let id: i64 = row.try_get("id")?;
    let state_str: String = row.try_get("state")?;
    let state = NewsState::parse_state(&state_str)
        .ok_or_else(|| StoreError::Corrupt(format!("news {} has unknown state {}", id, state_str)))?;
    let guid = row
        .try_get::<Option<String>, _>("guid")?
        .map(|value| -> Result<Guid, StoreError> {
            Ok(Guid {
                value,
                is_permalink: row.try_get("guid_is_permalink")?,
            })
        })
        .transpose()?;
    let author = if row.try_get::<bool, _>("has_author")? {
        Some(Person {
            name: row.try_get("author_name")?,
            email: row.try_get("author_email")?,
            uri: row.try_get("author_uri")?,
        })
    } else {
        None
    };
    let source = if row.try_get::<bool, _>("has_source")? {
        Some(Source {
            name: row.try_get("source_name")?,
            link: row.try_get("source_link")?,
        })
    } else {
        None
    };
    let properties: String = row.try_get("properties")?;

    Ok(News {
        id: Some(id),
        guid,
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        comments: row.try_get("comments")?,
        published_at: row.try_get("published_at")?,
        modified_at: row.try_get("modified_at")?,
        received_at: row.try_get("received_at")?,
        state,
        flagged: row.try_get("flagged")?,
        labels: BTreeSet::new(),
        properties: parse_json_map(&properties)?,
        attachments: Vec::new(),
        categories: Vec::new(),
        author,
        source,
    })
}

#[instrument(skip_all)]
pub async fn load_feed_by_link(pool: &Pool, link: &str) -> Result<Option<Feed>, StoreError> {
    let row = sqlx::query("SELECT * FROM feeds WHERE link = ?")
        .bind(link)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut feed = feed_from_row(&row)?;
    let feed_id = feed.id.unwrap_or_default();

    let rows = sqlx::query("SELECT * FROM news WHERE feed_id = ? ORDER BY position ASC, id ASC")
        .bind(feed_id)
        .fetch_all(pool)
        .await?;
    let mut news = rows
        .iter()
        .map(news_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    let mut attachments: HashMap<i64, Vec<Attachment>> = HashMap::new();
    let rows = sqlx::query(
        "SELECT a.news_id, a.link, a.mime_type, a.length FROM attachments a \
         JOIN news n ON n.id = a.news_id WHERE n.feed_id = ? ORDER BY a.id ASC",
    )
    .bind(feed_id)
    .fetch_all(pool)
    .await?;
    for row in rows {
        attachments
            .entry(row.try_get("news_id")?)
            .or_default()
            .push(Attachment {
                link: row.try_get("link")?,
                mime_type: row.try_get("mime_type")?,
                length: row.try_get("length")?,
            });
    }

    let mut categories: HashMap<i64, Vec<Category>> = HashMap::new();
    let rows = sqlx::query(
        "SELECT c.news_id, c.name, c.domain FROM categories c \
         JOIN news n ON n.id = c.news_id WHERE n.feed_id = ? ORDER BY c.id ASC",
    )
    .bind(feed_id)
    .fetch_all(pool)
    .await?;
    for row in rows {
        categories
            .entry(row.try_get("news_id")?)
            .or_default()
            .push(Category {
                name: row.try_get("name")?,
                domain: row.try_get("domain")?,
            });
    }

    let mut labels: HashMap<i64, BTreeSet<String>> = HashMap::new();
    let rows = sqlx::query(
        "SELECT nl.news_id, l.name FROM news_labels nl \
         JOIN labels l ON l.id = nl.label_id \
         JOIN news n ON n.id = nl.news_id WHERE n.feed_id = ?",
    )
    .bind(feed_id)
    .fetch_all(pool)
    .await?;
    for row in rows {
        labels
            .entry(row.try_get("news_id")?)
            .or_default()
            .insert(row.try_get("name")?);
    }

    for item in &mut news {
        let id = item.id.unwrap_or_default();
        item.attachments = attachments.remove(&id).unwrap_or_default();
        item.categories = categories.remove(&id).unwrap_or_default();
        item.labels = labels.remove(&id).unwrap_or_default();
    }
    feed.news = news;
    Ok(Some(feed))
}

/// Most recently modified live News equivalent to the given guid/link,
/// ignoring the feed at `exclude_feed_link`. Bin copies are included.
#[instrument(skip_all)]
pub async fn find_equivalent_news(
    pool: &Pool,
    guid: Option<&Guid>,
    link: Option<&str>,
    exclude_feed_link: &str,
) -> Result<Option<NewsState>, StoreError> {
    let permalink = guid.filter(|g| g.is_permalink).map(|g| g.value.as_str());
    if permalink.is_none() && link.is_none() {
        return Ok(None);
    }
    let state: Option<String> = sqlx::query_scalar(
        "SELECT n.state FROM news n \
         LEFT JOIN feeds f ON f.id = n.feed_id \
         WHERE (f.link IS NULL OR f.link <> ?1) \
           AND n.state <> 'HIDDEN' \
           AND ( \
             (?2 IS NOT NULL AND n.guid_is_permalink = 1 AND n.guid = ?2) \
             OR ((?2 IS NULL OR n.guid IS NULL OR n.guid_is_permalink = 0) \
                 AND ?3 IS NOT NULL AND n.link = ?3) \
           ) \
         ORDER BY COALESCE(n.modified_at, n.published_at, n.received_at) DESC, n.id DESC \
         LIMIT 1",
    )
    .bind(exclude_feed_link)
    .bind(permalink)
    .bind(link)
    .fetch_optional(pool)
    .await?;
    state
        .map(|s| {
            NewsState::parse_state(&s)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown news state {}", s)))
        })
        .transpose()
}

async fn insert_feed_tx(tx: &mut Transaction<'_, Sqlite>, feed: &Feed) -> Result<i64, StoreError> {
    let image = feed.image.clone().unwrap_or_default();
    let id: i64 = sqlx::query(
        "INSERT INTO feeds (link, title, description, homepage, format, language, copyright, \
         generator, published_at, last_build_at, image_url, image_title, image_link, properties) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&feed.link)
    .bind(&feed.title)
    .bind(&feed.description)
    .bind(&feed.homepage)
    .bind(&feed.format)
    .bind(&feed.language)
    .bind(&feed.copyright)
    .bind(&feed.generator)
    .bind(feed.published_at)
    .bind(feed.last_build_at)
    .bind(image.url)
    .bind(image.title)
    .bind(image.link)
    .bind(serde_json::to_string(&feed.properties)?)
    .fetch_one(&mut **tx)
    .await?
    .try_get("id")?;
    Ok(id)
}

async fn update_feed_tx(tx: &mut Transaction<'_, Sqlite>, id: i64, feed: &Feed) -> Result<(), StoreError> {
    let image = feed.image.clone().unwrap_or_default();
    sqlx::query(
        "UPDATE feeds SET title = ?, description = ?, homepage = ?, format = ?, language = ?, \
         copyright = ?, generator = ?, published_at = ?, last_build_at = ?, image_url = ?, \
         image_title = ?, image_link = ?, properties = ? WHERE id = ?",
    )
    .bind(&feed.title)
    .bind(&feed.description)
    .bind(&feed.homepage)
    .bind(&feed.format)
    .bind(&feed.language)
    .bind(&feed.copyright)
    .bind(&feed.generator)
    .bind(feed.published_at)
    .bind(feed.last_build_at)
    .bind(image.url)
    .bind(image.title)
    .bind(image.link)
    .bind(serde_json::to_string(&feed.properties)?)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn replace_children_tx(
    tx: &mut Transaction<'_, Sqlite>,
    news_id: i64,
    news: &News,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM attachments WHERE news_id = ?")
        .bind(news_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM categories WHERE news_id = ?")
        .bind(news_id)
        .execute(&mut **tx)
        .await?;
    for a in &news.attachments {
        sqlx::query("INSERT INTO attachments (news_id, link, mime_type, length) VALUES (?, ?, ?, ?)")
            .bind(news_id)
            .bind(&a.link)
            .bind(&a.mime_type)
            .bind(a.length)
            .execute(&mut **tx)
            .await?;
    }
    for c in &news.categories {
        sqlx::query("INSERT INTO categories (news_id, name, domain) VALUES (?, ?, ?)")
            .bind(news_id)
            .bind(&c.name)
            .bind(&c.domain)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn label_id_tx(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<i64, StoreError> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM labels WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }
    let id: i64 = sqlx::query("INSERT INTO labels (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?
        .try_get("id")?;
    Ok(id)
}

/// Parent of a News row: exactly one of feed or bin.
#[derive(Debug, Clone, Copy)]
enum Parent {
    Feed(i64),
    Bin(i64),
}

async fn insert_news_tx(
    tx: &mut Transaction<'_, Sqlite>,
    parent: Parent,
    news: &News,
) -> Result<i64, StoreError> {
    let (feed_id, bin_id) = match parent {
        Parent::Feed(id) => (Some(id), None),
        Parent::Bin(id) => (None, Some(id)),
    };
    let position: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM news WHERE feed_id IS ? AND bin_id IS ?",
    )
    .bind(feed_id)
    .bind(bin_id)
    .fetch_one(&mut **tx)
    .await?;
    let author = news.author.clone().unwrap_or_default();
    let source = news.source.clone().unwrap_or_default();
    let id: i64 = sqlx::query(
        "INSERT INTO news (feed_id, bin_id, position, guid, guid_is_permalink, link, title, \
         description, comments, published_at, modified_at, received_at, state, flagged, \
         author_name, author_email, author_uri, has_author, source_name, source_link, has_source, \
         properties) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(feed_id)
    .bind(bin_id)
    .bind(position)
    .bind(news.guid.as_ref().map(|g| g.value.as_str()))
    .bind(news.guid.as_ref().map(|g| g.is_permalink).unwrap_or(true))
    .bind(&news.link)
    .bind(&news.title)
    .bind(&news.description)
    .bind(&news.comments)
    .bind(news.published_at)
    .bind(news.modified_at)
    .bind(news.received_at)
    .bind(news.state.as_str())
    .bind(news.flagged)
    .bind(author.name)
    .bind(author.email)
    .bind(author.uri)
    .bind(news.author.is_some())
    .bind(source.name)
    .bind(source.link)
    .bind(news.source.is_some())
    .bind(serde_json::to_string(&news.properties)?)
    .fetch_one(&mut **tx)
    .await?
    .try_get("id")?;

    replace_children_tx(tx, id, news).await?;
    for label in &news.labels {
        let label_id = label_id_tx(tx, label).await?;
        sqlx::query("INSERT OR IGNORE INTO news_labels (news_id, label_id) VALUES (?, ?)")
            .bind(id)
            .bind(label_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(id)
}

/// Writes content fields only; state, flag, labels and properties belong to
/// the user and are changed through their own functions.
async fn update_news_content_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    news: &News,
) -> Result<(), StoreError> {
    let author = news.author.clone().unwrap_or_default();
    let source = news.source.clone().unwrap_or_default();
    let affected = sqlx::query(
        "UPDATE news SET link = ?, title = ?, description = ?, comments = ?, published_at = ?, \
         modified_at = ?, author_name = ?, author_email = ?, author_uri = ?, has_author = ?, \
         source_name = ?, source_link = ?, has_source = ? WHERE id = ?",
    )
    .bind(&news.link)
    .bind(&news.title)
    .bind(&news.description)
    .bind(&news.comments)
    .bind(news.published_at)
    .bind(news.modified_at)
    .bind(author.name)
    .bind(author.email)
    .bind(author.uri)
    .bind(news.author.is_some())
    .bind(source.name)
    .bind(source.link)
    .bind(news.source.is_some())
    .bind(id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if affected == 0 {
        return Err(StoreError::CommitConflict(format!("news {} no longer exists", id)));
    }
    replace_children_tx(tx, id, news).await
}

/// Tombstones a News: content and children dropped, guid/link kept so the
/// item is still recognised by later fetches. The guard is evaluated against
/// the stored row; returns false when it kept the News.
async fn hide_news_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    guard: RemovalGuard,
) -> Result<bool, StoreError> {
    let affected = sqlx::query(
        "UPDATE news SET state = 'HIDDEN', description = NULL, comments = NULL, flagged = 0, \
         properties = '{}' WHERE id = ?1 AND state <> 'HIDDEN' \
         AND (?2 = 0 OR flagged = 0) \
         AND (?3 = 0 OR NOT EXISTS (SELECT 1 FROM news_labels WHERE news_id = ?1)) \
         AND (?4 = 0 OR state NOT IN ('NEW', 'UNREAD'))",
    )
    .bind(id)
    .bind(guard.keep_flagged)
    .bind(guard.keep_labeled)
    .bind(guard.keep_unread)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if affected == 0 {
        return Ok(false);
    }
    sqlx::query("DELETE FROM attachments WHERE news_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM categories WHERE news_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM news_labels WHERE news_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(true)
}

/// Applies one reload's changes in a single transaction.
#[instrument(skip_all, fields(link = %changes.feed.link))]
pub async fn commit_changes(pool: &Pool, changes: ChangeSet) -> Result<Committed, StoreError> {
    let mut tx = pool.begin().await?;

    let feed_id = match changes.feed.id {
        Some(id) => {
            if changes.write_feed {
                update_feed_tx(&mut tx, id, &changes.feed).await?;
            }
            id
        }
        None => insert_feed_tx(&mut tx, &changes.feed).await?,
    };

    let mut committed = Committed {
        feed_id: Some(feed_id),
        ..Default::default()
    };
    for mut news in changes.upserted {
        match news.id {
            Some(id) => {
                update_news_content_tx(&mut tx, id, &news).await?;
                committed.updated.push(news);
            }
            None => {
                news.id = Some(insert_news_tx(&mut tx, Parent::Feed(feed_id), &news).await?);
                committed.inserted.push(news);
            }
        }
    }
    for news in changes.removed {
        let Some(id) = news.id else {
            continue;
        };
        if hide_news_tx(&mut tx, id, changes.removal_guard).await? {
            committed.removed.push(news);
        } else {
            debug!(news_id = id, "removal skipped, news changed since load");
        }
    }

    match changes.conditional_get {
        Some(ConditionalGetChange::Upsert(cond)) => {
            upsert_conditional_get_tx(&mut tx, &changes.feed.link, &cond).await?
        }
        Some(ConditionalGetChange::Delete) => {
            delete_conditional_get_tx(&mut tx, &changes.feed.link).await?
        }
        None => {}
    }

    tx.commit().await?;
    debug!(
        feed_id,
        inserted = committed.inserted.len(),
        updated = committed.updated.len(),
        removed = committed.removed.len(),
        "committed reload"
    );
    Ok(committed)
}

// ---------------------------------------------------------------------------
// conditional GET
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_conditional_get(pool: &Pool, link: &str) -> Result<Option<ConditionalGet>, StoreError> {
    let row = sqlx::query("SELECT if_modified_since, if_none_match FROM conditional_gets WHERE link = ?")
        .bind(link)
        .fetch_optional(pool)
        .await?;
    row.map(|row| -> Result<ConditionalGet, StoreError> {
        Ok(ConditionalGet {
            if_modified_since: row.try_get("if_modified_since")?,
            if_none_match: row.try_get("if_none_match")?,
        })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn upsert_conditional_get(pool: &Pool, link: &str, cond: &ConditionalGet) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    upsert_conditional_get_tx(&mut tx, link, cond).await?;
    tx.commit().await?;
    Ok(())
}

async fn upsert_conditional_get_tx(
    tx: &mut Transaction<'_, Sqlite>,
    link: &str,
    cond: &ConditionalGet,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO conditional_gets (link, if_modified_since, if_none_match) VALUES (?, ?, ?) \
         ON CONFLICT(link) DO UPDATE SET if_modified_since = excluded.if_modified_since, \
         if_none_match = excluded.if_none_match, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(link)
    .bind(&cond.if_modified_since)
    .bind(&cond.if_none_match)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_conditional_get(pool: &Pool, link: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    delete_conditional_get_tx(&mut tx, link).await?;
    tx.commit().await?;
    Ok(())
}

async fn delete_conditional_get_tx(tx: &mut Transaction<'_, Sqlite>, link: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM conditional_gets WHERE link = ?")
        .bind(link)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// bookmarks
// ---------------------------------------------------------------------------

fn opt_u32(row: &SqliteRow, col: &str) -> Result<Option<u32>, StoreError> {
    row.try_get::<Option<i64>, _>(col)?
        .map(|v| u32::try_from(v).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", col, v))))
        .transpose()
}

fn bookmark_from_row(row: &SqliteRow) -> Result<Bookmark, StoreError> {
    Ok(Bookmark {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        feed_link: row.try_get("feed_link")?,
        retention: RetentionOverrides {
            max_count: opt_u32(row, "max_count")?,
            max_age_days: opt_u32(row, "max_age_days")?,
            keep_unread: row.try_get("keep_unread")?,
            keep_flagged: row.try_get("keep_flagged")?,
            keep_labeled: row.try_get("keep_labeled")?,
            delete_read: row.try_get("delete_read")?,
        },
        last_error: row.try_get("last_error")?,
        last_reloaded_at: row.try_get("last_reloaded_at")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_bookmark(
    pool: &Pool,
    name: &str,
    feed_link: &str,
    retention: &RetentionOverrides,
) -> Result<i64, StoreError> {
    // `last_insert_rowid` rather than RETURNING: a RETURNING row fetched
    // straight off the pool leaves the statement open and the insert
    // invisible to the other pooled connections.
    let id = sqlx::query(
        "INSERT INTO bookmarks (name, feed_link, max_count, max_age_days, keep_unread, \
         keep_flagged, keep_labeled, delete_read) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(feed_link)
    .bind(retention.max_count.map(i64::from))
    .bind(retention.max_age_days.map(i64::from))
    .bind(retention.keep_unread)
    .bind(retention.keep_flagged)
    .bind(retention.keep_labeled)
    .bind(retention.delete_read)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

#[instrument(skip_all)]
pub async fn update_bookmark_retention(
    pool: &Pool,
    id: i64,
    retention: &RetentionOverrides,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE bookmarks SET max_count = ?, max_age_days = ?, keep_unread = ?, keep_flagged = ?, \
         keep_labeled = ?, delete_read = ? WHERE id = ?",
    )
    .bind(retention.max_count.map(i64::from))
    .bind(retention.max_age_days.map(i64::from))
    .bind(retention.keep_unread)
    .bind(retention.keep_flagged)
    .bind(retention.keep_labeled)
    .bind(retention.delete_read)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_bookmark(pool: &Pool, id: i64) -> Result<Option<Bookmark>, StoreError> {
    let row = sqlx::query("SELECT * FROM bookmarks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(bookmark_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_bookmarks(pool: &Pool) -> Result<Vec<Bookmark>, StoreError> {
    let rows = sqlx::query("SELECT * FROM bookmarks ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(bookmark_from_row).collect()
}

#[instrument(skip_all)]
pub async fn record_reload_status(
    pool: &Pool,
    bookmark_id: i64,
    error: Option<&str>,
) -> Result<(), StoreError> {
    match error {
        Some(msg) => {
            sqlx::query("UPDATE bookmarks SET last_error = ? WHERE id = ?")
                .bind(msg)
                .bind(bookmark_id)
                .execute(pool)
                .await?;
        }
        None => {
            sqlx::query("UPDATE bookmarks SET last_error = NULL, last_reloaded_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(bookmark_id)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// user actions on news
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_news(pool: &Pool, feed_link: &str, include_hidden: bool) -> Result<Vec<NewsSummary>, StoreError> {
    let rows = sqlx::query(
        "SELECT n.id, n.title, n.link, n.state, n.flagged, n.published_at FROM news n \
         JOIN feeds f ON f.id = n.feed_id WHERE f.link = ? AND (? OR n.state <> 'HIDDEN') \
         ORDER BY COALESCE(n.published_at, n.received_at) DESC, n.id DESC",
    )
    .bind(feed_link)
    .bind(include_hidden)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<NewsSummary, StoreError> {
            let state: String = row.try_get("state")?;
            Ok(NewsSummary {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                link: row.try_get("link")?,
                state: NewsState::parse_state(&state)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown news state {}", state)))?,
                flagged: row.try_get("flagged")?,
                published_at: row.try_get::<Option<DateTime<Utc>>, _>("published_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn set_news_state(pool: &Pool, news_id: i64, state: NewsState) -> Result<(), StoreError> {
    sqlx::query("UPDATE news SET state = ? WHERE id = ? AND state <> 'HIDDEN'")
        .bind(state.as_str())
        .bind(news_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_news_flagged(pool: &Pool, news_id: i64, flagged: bool) -> Result<(), StoreError> {
    sqlx::query("UPDATE news SET flagged = ? WHERE id = ?")
        .bind(flagged)
        .bind(news_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn add_news_label(pool: &Pool, news_id: i64, label: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    let label_id = label_id_tx(&mut tx, label).await?;
    sqlx::query("INSERT OR IGNORE INTO news_labels (news_id, label_id) VALUES (?, ?)")
        .bind(news_id)
        .bind(label_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Explicit user delete; same tombstone as retention.
#[instrument(skip_all)]
pub async fn delete_news(pool: &Pool, news_id: i64) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    hide_news_tx(&mut tx, news_id, RemovalGuard::default()).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_news_bin(pool: &Pool, name: &str) -> Result<i64, StoreError> {
    let id = sqlx::query("INSERT INTO news_bins (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_news_bins(pool: &Pool) -> Result<Vec<NewsBin>, StoreError> {
    let rows = sqlx::query("SELECT id, name FROM news_bins ORDER BY name ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| -> Result<NewsBin, StoreError> {
            Ok(NewsBin {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })
        })
        .collect()
}

/// Copies a News (with children and labels) into a bin.
#[instrument(skip_all)]
pub async fn copy_news_to_bin(pool: &Pool, news_id: i64, bin_id: i64) -> Result<i64, StoreError> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT * FROM news WHERE id = ?")
        .bind(news_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("news {} not found", news_id)))?;
    let mut news = news_from_row(&row)?;
    news.attachments = sqlx::query("SELECT link, mime_type, length FROM attachments WHERE news_id = ? ORDER BY id")
        .bind(news_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| -> Result<Attachment, StoreError> {
            Ok(Attachment {
                link: r.try_get("link")?,
                mime_type: r.try_get("mime_type")?,
                length: r.try_get("length")?,
            })
        })
        .collect::<Result<_, _>>()?;
    news.categories = sqlx::query("SELECT name, domain FROM categories WHERE news_id = ? ORDER BY id")
        .bind(news_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| -> Result<Category, StoreError> {
            Ok(Category {
                name: r.try_get("name")?,
                domain: r.try_get("domain")?,
            })
        })
        .collect::<Result<_, _>>()?;
    news.labels = sqlx::query_scalar::<_, String>(
        "SELECT l.name FROM news_labels nl JOIN labels l ON l.id = nl.label_id WHERE nl.news_id = ?",
    )
    .bind(news_id)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .collect();

    let id = insert_news_tx(&mut tx, Parent::Bin(bin_id), &news).await?;
    tx.commit().await?;
    Ok(id)
}

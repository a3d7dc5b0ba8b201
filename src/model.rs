use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NewsState {
    New,
    Unread,
    Read,
    /// Tombstone: removed by the user or by retention, kept so the item is
    /// recognised (and not re-added) when a feed still carries it.
    Hidden,
}

impl NewsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewsState::New => "NEW",
            NewsState::Unread => "UNREAD",
            NewsState::Read => "READ",
            NewsState::Hidden => "HIDDEN",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(NewsState::New),
            "UNREAD" => Some(NewsState::Unread),
            "READ" => Some(NewsState::Read),
            "HIDDEN" => Some(NewsState::Hidden),
            _ => None,
        }
    }

    /// NEW and UNREAD both count as "not yet read".
    pub fn is_unread(&self) -> bool {
        matches!(self, NewsState::New | NewsState::Unread)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guid {
    pub value: String,
    pub is_permalink: bool,
}

impl Guid {
    pub fn permalink(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_permalink: true,
        }
    }

    pub fn opaque(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_permalink: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub name: Option<String>,
    pub email: Option<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub name: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub link: String,
    pub mime_type: Option<String>,
    pub length: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub url: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct News {
    /// `None` until the store assigns one.
    pub id: Option<i64>,
    pub guid: Option<Guid>,
    pub link: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub state: NewsState,
    pub flagged: bool,
    pub labels: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub categories: Vec<Category>,
    pub author: Option<Person>,
    pub source: Option<Source>,
}

impl News {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            guid: None,
            link: None,
            title: title.into(),
            description: None,
            comments: None,
            published_at: None,
            modified_at: None,
            received_at: Utc::now(),
            state: NewsState::New,
            flagged: false,
            labels: BTreeSet::new(),
            properties: BTreeMap::new(),
            attachments: Vec::new(),
            categories: Vec::new(),
            author: None,
            source: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_guid(mut self, guid: Guid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn with_published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_state(mut self, state: NewsState) -> Self {
        self.state = state;
        self
    }

    /// Date used for age-based decisions: publish date, else receive date.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.received_at)
    }

    pub fn is_visible(&self) -> bool {
        self.state != NewsState::Hidden
    }

    /// Turns the item into a tombstone: identity (guid, link, title, dates)
    /// stays, everything else goes.
    pub fn hide(&mut self) {
        self.state = NewsState::Hidden;
        self.description = None;
        self.comments = None;
        self.flagged = false;
        self.labels.clear();
        self.properties.clear();
        self.attachments.clear();
        self.categories.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    pub id: Option<i64>,
    pub link: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub format: Option<String>,
    pub language: Option<String>,
    pub copyright: Option<String>,
    pub generator: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_build_at: Option<DateTime<Utc>>,
    pub image: Option<Image>,
    pub properties: BTreeMap<String, String>,
    pub news: Vec<News>,
}

impl Feed {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            id: None,
            link: link.into(),
            title: None,
            description: None,
            homepage: None,
            format: None,
            language: None,
            copyright: None,
            generator: None,
            published_at: None,
            last_build_at: None,
            image: None,
            properties: BTreeMap::new(),
            news: Vec::new(),
        }
    }

    pub fn visible_news(&self) -> impl Iterator<Item = &News> {
        self.news.iter().filter(|n| n.is_visible())
    }
}

/// Validators remembered per feed link for conditional GET.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConditionalGet {
    pub if_modified_since: Option<String>,
    pub if_none_match: Option<String>,
}

impl ConditionalGet {
    pub fn is_empty(&self) -> bool {
        self.if_modified_since.is_none() && self.if_none_match.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionSettings {
    /// 0 = unlimited.
    pub max_count: u32,
    /// 0 = unlimited.
    pub max_age_days: u32,
    pub keep_unread: bool,
    pub keep_flagged: bool,
    pub keep_labeled: bool,
    pub delete_read: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_count: 200,
            max_age_days: 30,
            keep_unread: false,
            keep_flagged: true,
            keep_labeled: true,
            delete_read: false,
        }
    }
}

/// Per-bookmark overrides; unset fields fall back to the global defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionOverrides {
    pub max_count: Option<u32>,
    pub max_age_days: Option<u32>,
    pub keep_unread: Option<bool>,
    pub keep_flagged: Option<bool>,
    pub keep_labeled: Option<bool>,
    pub delete_read: Option<bool>,
}

impl RetentionOverrides {
    pub fn resolve(&self, defaults: &RetentionSettings) -> RetentionSettings {
        RetentionSettings {
            max_count: self.max_count.unwrap_or(defaults.max_count),
            max_age_days: self.max_age_days.unwrap_or(defaults.max_age_days),
            keep_unread: self.keep_unread.unwrap_or(defaults.keep_unread),
            keep_flagged: self.keep_flagged.unwrap_or(defaults.keep_flagged),
            keep_labeled: self.keep_labeled.unwrap_or(defaults.keep_labeled),
            delete_read: self.delete_read.unwrap_or(defaults.delete_read),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bookmark {
    pub id: i64,
    pub name: String,
    pub feed_link: String,
    pub retention: RetentionOverrides,
    pub last_error: Option<String>,
    pub last_reloaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsBin {
    pub id: i64,
    pub name: String,
}

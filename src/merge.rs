//! Structural merge of a freshly interpreted feed into its persisted copy.
//!
//! The persisted feed is mutated in place. Matched News keep their id, state,
//! flag, labels and properties; only content fields are copied over, and only
//! a real change marks an item updated. Unmatched News are appended.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::equivalence::{are_equivalent, find_equivalent};
use crate::model::{Feed, News, NewsState};

/// Supplies the state an unmatched incoming News should start with, usually
/// from an equivalent item stored elsewhere.
pub trait StateSeed {
    fn seed_state(&self, incoming_index: usize, news: &News) -> Option<NewsState>;
}

/// Every new item starts as NEW.
pub struct NoSeed;

impl StateSeed for NoSeed {
    fn seed_state(&self, _incoming_index: usize, _news: &News) -> Option<NewsState> {
        None
    }
}

impl StateSeed for HashMap<usize, NewsState> {
    fn seed_state(&self, incoming_index: usize, _news: &News) -> Option<NewsState> {
        self.get(&incoming_index).copied()
    }
}

/// Positions refer to `persisted.news` after the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub feed_updated: bool,
    pub updated: BTreeSet<usize>,
    pub added: Vec<usize>,
    pub removed: Vec<usize>,
    pub structural_change: bool,
    /// Added items whose state is NEW.
    pub new_count: usize,
}

impl MergeResult {
    /// No updated, added or removed objects.
    pub fn is_empty(&self) -> bool {
        !self.feed_updated
            && self.updated.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
    }

    /// Folds retention decisions into the result. Removed items are no longer
    /// reported as updated.
    pub fn absorb_removals(&mut self, removed: impl IntoIterator<Item = usize>) {
        for idx in removed {
            if !self.removed.contains(&idx) {
                self.updated.remove(&idx);
                self.removed.push(idx);
            }
        }
        self.structural_change = !self.added.is_empty() || !self.removed.is_empty();
    }
}

/// Indices of incoming News that have no equivalent in `persisted`.
pub fn unmatched_indices(persisted: &Feed, incoming: &Feed) -> Vec<usize> {
    incoming
        .news
        .iter()
        .enumerate()
        .filter(|(_, news)| find_equivalent(news, &persisted.news).is_none())
        .map(|(idx, _)| idx)
        .collect()
}

pub fn merge(persisted: &mut Feed, incoming: Feed, seed: &dyn StateSeed) -> MergeResult {
    let mut result = MergeResult {
        feed_updated: merge_header(persisted, &incoming),
        ..Default::default()
    };

    for (incoming_index, mut news) in incoming.news.into_iter().enumerate() {
        match find_equivalent(&news, &persisted.news) {
            Some(idx) => {
                if persisted.news[idx].state == NewsState::Hidden {
                    continue;
                }
                if link_would_collide(&persisted.news, idx, &news) {
                    debug!(
                        link = news.link.as_deref().unwrap_or_default(),
                        "keeping old link, new one belongs to another news"
                    );
                    news.link = None;
                }
                let existing = &mut persisted.news[idx];
                if merge_news(existing, news) && existing.id.is_some() {
                    result.updated.insert(idx);
                }
            }
            None => {
                news.id = None;
                news.state = match seed.seed_state(incoming_index, &news) {
                    Some(state @ (NewsState::Read | NewsState::Unread)) => state,
                    _ => NewsState::New,
                };
                if news.state == NewsState::New {
                    result.new_count += 1;
                }
                persisted.news.push(news);
                result.added.push(persisted.news.len() - 1);
            }
        }
    }

    result.structural_change = !result.added.is_empty() || !result.removed.is_empty();
    debug_assert!(
        !has_equivalent_duplicates(persisted),
        "merge left mutually equivalent news in {}",
        persisted.link
    );
    debug!(
        link = %persisted.link,
        added = result.added.len(),
        updated = result.updated.len(),
        feed_updated = result.feed_updated,
        "merged feed"
    );
    result
}

/// True if giving `news[idx]` the incoming link would make it equivalent to
/// some other News of the feed.
fn link_would_collide(news: &[News], idx: usize, incoming: &News) -> bool {
    if incoming.link.is_none() || incoming.link == news[idx].link {
        return false;
    }
    let candidate = News {
        link: incoming.link.clone(),
        ..news[idx].clone()
    };
    news.iter()
        .enumerate()
        .any(|(other, n)| other != idx && are_equivalent(&candidate, n))
}

/// Copies feed metadata onto `target`; true if any field differed.
fn merge_header(target: &mut Feed, incoming: &Feed) -> bool {
    let mut dirty = false;
    dirty |= set_if_changed(&mut target.title, incoming.title.clone());
    dirty |= set_if_changed(&mut target.description, incoming.description.clone());
    dirty |= set_if_changed(&mut target.homepage, incoming.homepage.clone());
    dirty |= set_if_changed(&mut target.format, incoming.format.clone());
    dirty |= set_if_changed(&mut target.language, incoming.language.clone());
    dirty |= set_if_changed(&mut target.copyright, incoming.copyright.clone());
    dirty |= set_if_changed(&mut target.generator, incoming.generator.clone());
    dirty |= set_if_changed(&mut target.published_at, incoming.published_at);
    dirty |= set_if_changed(&mut target.last_build_at, incoming.last_build_at);
    dirty |= set_if_changed(&mut target.image, incoming.image.clone());
    dirty
}

/// Copies content fields from `incoming` onto `existing`; true if anything
/// changed.
fn merge_news(existing: &mut News, incoming: News) -> bool {
    let mut dirty = false;
    dirty |= set_if_changed(&mut existing.title, incoming.title);
    dirty |= set_if_changed(&mut existing.description, incoming.description);
    if incoming.link.is_some() {
        dirty |= set_if_changed(&mut existing.link, incoming.link);
    }
    dirty |= set_if_changed(&mut existing.comments, incoming.comments);
    dirty |= set_if_changed(&mut existing.published_at, incoming.published_at);
    dirty |= set_if_changed(&mut existing.modified_at, incoming.modified_at);
    dirty |= set_if_changed(&mut existing.author, incoming.author);
    dirty |= set_if_changed(&mut existing.source, incoming.source);
    // no stable identity for leaf children: replace the whole list
    dirty |= set_if_changed(&mut existing.attachments, incoming.attachments);
    dirty |= set_if_changed(&mut existing.categories, incoming.categories);
    dirty
}

fn set_if_changed<T: PartialEq>(target: &mut T, value: T) -> bool {
    if *target != value {
        *target = value;
        true
    } else {
        false
    }
}

pub fn has_equivalent_duplicates(feed: &Feed) -> bool {
    feed.news.iter().enumerate().any(|(i, a)| {
        feed.news[i + 1..]
            .iter()
            .any(|b| are_equivalent(a, b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, Guid};
    use chrono::{Duration, TimeZone, Utc};

    fn persisted_feed(count: usize) -> Feed {
        let mut feed = Feed::new("http://example.com/feed");
        feed.id = Some(1);
        feed.title = Some("Example".into());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..count {
            let mut news = News::new(format!("item {i}"))
                .with_guid(Guid::permalink(format!("g{i}")))
                .with_link(format!("http://example.com/{i}"))
                .with_published(base + Duration::hours(i as i64))
                .with_state(NewsState::Read);
            news.id = Some(100 + i as i64);
            feed.news.push(news);
        }
        feed
    }

    fn incoming_copy(feed: &Feed) -> Feed {
        let mut copy = feed.clone();
        copy.id = None;
        for news in &mut copy.news {
            news.id = None;
            news.state = NewsState::New;
            news.flagged = false;
            news.labels.clear();
            news.properties.clear();
        }
        copy
    }

    #[test]
    fn empty_incoming_leaves_everything_untouched() {
        let mut persisted = persisted_feed(4);
        let before = persisted.clone();
        let mut incoming = incoming_copy(&persisted);
        incoming.news.clear();

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert!(result.is_empty());
        assert!(!result.structural_change);
        assert_eq!(persisted, before);
    }

    #[test]
    fn updated_titles_keep_identity_and_state() {
        let mut persisted = persisted_feed(3);
        persisted.news[1].flagged = true;
        persisted.news[2].labels.insert("work".into());
        let mut incoming = incoming_copy(&persisted);
        for news in &mut incoming.news {
            news.title = format!("{} (edited)", news.title);
        }

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert_eq!(persisted.news.len(), 3);
        assert_eq!(result.updated.len(), 3);
        assert!(result.added.is_empty());
        assert!(!result.structural_change);
        for (i, news) in persisted.news.iter().enumerate() {
            assert!(news.title.ends_with("(edited)"));
            assert_eq!(news.id, Some(100 + i as i64));
            assert_eq!(news.state, NewsState::Read);
        }
        assert!(persisted.news[1].flagged);
        assert!(persisted.news[2].labels.contains("work"));
    }

    #[test]
    fn same_content_twice_is_idempotent() {
        let mut persisted = persisted_feed(0);
        let source = {
            let mut f = persisted_feed(3);
            f.title = Some("Renamed".into());
            incoming_copy(&f)
        };

        let first = merge(&mut persisted, source.clone(), &NoSeed);
        assert!(first.feed_updated);
        assert_eq!(first.added.len(), 3);
        assert_eq!(first.new_count, 3);
        assert!(first.structural_change);

        // pretend the store assigned ids
        for (i, news) in persisted.news.iter_mut().enumerate() {
            news.id = Some(i as i64 + 1);
        }
        let second = merge(&mut persisted, source, &NoSeed);
        assert!(second.is_empty());
        assert!(!second.structural_change);
    }

    #[test]
    fn unchanged_fields_do_not_mark_updated() {
        let mut persisted = persisted_feed(2);
        let mut incoming = incoming_copy(&persisted);
        incoming.news[0].description = Some("fresh".into());

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert_eq!(result.updated.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(!result.feed_updated);
    }

    #[test]
    fn attachments_are_replaced_when_different() {
        let mut persisted = persisted_feed(1);
        persisted.news[0].attachments = vec![Attachment {
            link: "http://example.com/a.mp3".into(),
            mime_type: Some("audio/mpeg".into()),
            length: Some(10),
        }];
        let mut incoming = incoming_copy(&persisted);
        incoming.news[0].attachments = vec![Attachment {
            link: "http://example.com/b.mp3".into(),
            mime_type: None,
            length: None,
        }];

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert!(result.updated.contains(&0));
        assert_eq!(persisted.news[0].attachments.len(), 1);
        assert_eq!(persisted.news[0].attachments[0].link, "http://example.com/b.mp3");
    }

    #[test]
    fn new_items_are_appended_as_new_unless_seeded() {
        let mut persisted = persisted_feed(1);
        let mut incoming = incoming_copy(&persisted);
        incoming
            .news
            .push(News::new("fresh").with_link("http://example.com/fresh"));
        incoming
            .news
            .push(News::new("seen").with_link("http://other.example/seen"));

        let mut seeds = HashMap::new();
        seeds.insert(2, NewsState::Read);
        let result = merge(&mut persisted, incoming, &seeds);

        assert_eq!(result.added, vec![1, 2]);
        assert_eq!(result.new_count, 1);
        assert!(result.structural_change);
        assert_eq!(persisted.news[1].state, NewsState::New);
        assert_eq!(persisted.news[2].state, NewsState::Read);
    }

    #[test]
    fn hidden_seed_state_is_not_adopted() {
        let mut persisted = persisted_feed(0);
        let mut incoming = incoming_copy(&persisted);
        incoming.news.push(News::new("x").with_link("http://example.com/x"));
        let mut seeds = HashMap::new();
        seeds.insert(0, NewsState::Hidden);

        let result = merge(&mut persisted, incoming, &seeds);
        assert_eq!(result.new_count, 1);
        assert_eq!(persisted.news[0].state, NewsState::New);
    }

    #[test]
    fn duplicates_within_one_fetch_collapse() {
        let mut persisted = persisted_feed(0);
        let mut incoming = incoming_copy(&persisted);
        incoming.news.push(News::new("one").with_link("http://example.com/dup"));
        incoming.news.push(News::new("two").with_link("http://example.com/dup"));

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert_eq!(persisted.news.len(), 1);
        assert_eq!(result.added, vec![0]);
        assert_eq!(persisted.news[0].title, "two");
        assert!(!has_equivalent_duplicates(&persisted));
    }

    #[test]
    fn hidden_items_are_not_resurrected() {
        let mut persisted = persisted_feed(2);
        persisted.news[0].state = NewsState::Hidden;
        let mut incoming = incoming_copy(&persisted);
        incoming.news[0].title = "changed".into();

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert!(result.is_empty());
        assert_eq!(persisted.news[0].state, NewsState::Hidden);
        assert_eq!(persisted.news[0].title, "item 0");
    }

    #[test]
    fn link_taken_by_another_news_is_not_copied() {
        let mut persisted = persisted_feed(0);
        let mut by_guid = News::new("guid item")
            .with_guid(Guid::permalink("g1"))
            .with_link("http://example.com/1");
        by_guid.id = Some(1);
        let mut by_link = News::new("link item").with_link("http://example.com/2");
        by_link.id = Some(2);
        persisted.news.push(by_guid);
        persisted.news.push(by_link);

        let mut incoming = Feed::new("http://example.com/feed");
        incoming.title = Some("Example".into());
        incoming.news.push(
            News::new("guid item, retitled")
                .with_guid(Guid::permalink("g1"))
                .with_link("http://example.com/2"),
        );

        let result = merge(&mut persisted, incoming, &NoSeed);
        assert_eq!(persisted.news.len(), 2);
        assert!(!has_equivalent_duplicates(&persisted));
        assert_eq!(persisted.news[0].link.as_deref(), Some("http://example.com/1"));
        assert_eq!(persisted.news[0].title, "guid item, retitled");
        assert_eq!(result.updated, BTreeSet::from([0]));
        assert!(result.added.is_empty());
    }

    #[test]
    fn absorbing_removals_marks_structural_change() {
        let mut result = MergeResult::default();
        result.updated.insert(3);
        result.absorb_removals(vec![3, 4, 4]);
        assert_eq!(result.removed, vec![3, 4]);
        assert!(result.updated.is_empty());
        assert!(result.structural_change);
    }
}

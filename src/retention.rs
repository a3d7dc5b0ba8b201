//! Decides which News of a feed should be removed to respect a bookmark's
//! retention settings. Never mutates the feed.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Feed, NewsState, RetentionSettings};

/// Positions into `feed.news` to remove. Does nothing when the last reload
/// brought no new items.
pub fn apply(settings: &RetentionSettings, feed: &Feed, new_count: usize) -> Vec<usize> {
    if new_count == 0 {
        return Vec::new();
    }
    select(settings, feed, Utc::now())
}

/// Evaluates the policy regardless of how many items arrived, e.g. after the
/// user tightened the settings.
pub fn apply_forced(settings: &RetentionSettings, feed: &Feed) -> Vec<usize> {
    select(settings, feed, Utc::now())
}

pub fn select(settings: &RetentionSettings, feed: &Feed, now: DateTime<Utc>) -> Vec<usize> {
    let visible = feed.visible_news().count();

    let mut candidates: Vec<usize> = feed
        .news
        .iter()
        .enumerate()
        .filter(|(_, news)| news.is_visible())
        .filter(|(_, news)| !(settings.keep_flagged && news.flagged))
        .filter(|(_, news)| !(settings.keep_unread && news.state.is_unread()))
        .filter(|(_, news)| !(settings.keep_labeled && !news.labels.is_empty()))
        .map(|(idx, _)| idx)
        .collect();
    // oldest first, insertion order breaks ties
    candidates.sort_by_key(|&idx| (feed.news[idx].effective_date(), idx));

    let mut removed = Vec::new();
    if settings.delete_read {
        candidates.retain(|&idx| {
            if feed.news[idx].state == NewsState::Read {
                removed.push(idx);
                false
            } else {
                true
            }
        });
    }

    if settings.max_count > 0 {
        let remaining = visible - removed.len();
        let excess = remaining.saturating_sub(settings.max_count as usize);
        let take = excess.min(candidates.len());
        removed.extend(candidates.drain(..take));
    }

    if settings.max_age_days > 0 {
        let cutoff = now - Duration::days(i64::from(settings.max_age_days));
        removed.extend(
            candidates
                .iter()
                .copied()
                .filter(|&idx| feed.news[idx].effective_date() < cutoff),
        );
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::News;
    use chrono::TimeZone;

    fn settings() -> RetentionSettings {
        RetentionSettings {
            max_count: 0,
            max_age_days: 0,
            keep_unread: false,
            keep_flagged: true,
            keep_labeled: true,
            delete_read: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    /// `states[i]` gets a publish date `len - i` days before `now`.
    fn feed_with(states: &[NewsState]) -> Feed {
        let mut feed = Feed::new("http://example.com/feed");
        let len = states.len() as i64;
        for (i, state) in states.iter().enumerate() {
            let mut news = News::new(format!("n{i}"))
                .with_link(format!("http://example.com/{i}"))
                .with_published(now() - Duration::days(len - i as i64))
                .with_state(*state);
            news.id = Some(i as i64 + 1);
            feed.news.push(news);
        }
        feed
    }

    #[test]
    fn nothing_new_means_no_evaluation() {
        let feed = feed_with(&[NewsState::Read; 10]);
        let s = RetentionSettings {
            max_count: 1,
            ..settings()
        };
        assert!(apply(&s, &feed, 0).is_empty());
        assert_eq!(apply_forced(&s, &feed).len(), 9);
    }

    #[test]
    fn max_count_with_keep_unread_removes_oldest_read() {
        use NewsState::*;
        // ascending by date; unread items are spread across the list
        let feed = feed_with(&[Read, Unread, Read, Read, New, Read, Read, Unread, Read, Read]);
        let s = RetentionSettings {
            max_count: 5,
            keep_unread: true,
            ..settings()
        };

        let removed = select(&s, &feed, now());
        assert_eq!(removed, vec![0, 2, 3, 5, 6]);
        // 3 unread + the 2 newest read survive
        let survivors: Vec<usize> = (0..10).filter(|i| !removed.contains(i)).collect();
        assert_eq!(survivors, vec![1, 4, 7, 8, 9]);
    }

    #[test]
    fn flagged_and_labeled_items_are_never_removed() {
        let mut feed = feed_with(&[NewsState::Read; 4]);
        feed.news[0].flagged = true;
        feed.news[1].labels.insert("keep".into());
        let s = RetentionSettings {
            max_count: 1,
            ..settings()
        };

        let removed = select(&s, &feed, now());
        assert_eq!(removed, vec![2, 3]);
    }

    #[test]
    fn max_age_removes_remaining_old_candidates() {
        let feed = feed_with(&[NewsState::Read; 6]);
        let s = RetentionSettings {
            max_count: 5,
            max_age_days: 3,
            ..settings()
        };

        let mut removed = select(&s, &feed, now());
        removed.sort();
        // count removes item 0 (6 days), age removes 1..=2 (5 and 4 days)
        // item 3 is exactly 3 days old and stays
        assert_eq!(removed, vec![0, 1, 2]);
    }

    #[test]
    fn hidden_items_do_not_count() {
        use NewsState::*;
        let feed = feed_with(&[Hidden, Hidden, Read, Read]);
        let s = RetentionSettings {
            max_count: 2,
            ..settings()
        };
        assert!(select(&s, &feed, now()).is_empty());
    }

    #[test]
    fn delete_read_removes_every_read_candidate() {
        use NewsState::*;
        let mut feed = feed_with(&[Read, Unread, Read, New]);
        feed.news[2].flagged = true;
        let s = RetentionSettings {
            delete_read: true,
            ..settings()
        };
        assert_eq!(select(&s, &feed, now()), vec![0]);
    }

    #[test]
    fn undated_items_use_receive_date() {
        let mut feed = feed_with(&[NewsState::Read; 2]);
        feed.news[0].published_at = None;
        feed.news[0].received_at = now() - Duration::days(40);
        let s = RetentionSettings {
            max_age_days: 30,
            ..settings()
        };
        assert_eq!(select(&s, &feed, now()), vec![0]);
    }
}

//! Decides whether two News describe the same story.
//!
//! Rules, in order:
//! - a guid only counts when it is a permalink; an opaque guid is treated as
//!   if the item had none;
//! - if both items have a (permalink) guid, the guid values decide;
//! - otherwise both links must be present and equal;
//! - items with neither guid nor link fall back to title + publish date.
//!
//! The relation is symmetric but not transitive over arbitrary sets: `a` may
//! match `c` by link and `b` by guid while `b` and `c` differ. Callers match
//! against the first candidate and accept that limitation.

use crate::model::News;

fn effective_guid(news: &News) -> Option<&str> {
    news.guid
        .as_ref()
        .filter(|g| g.is_permalink)
        .map(|g| g.value.as_str())
}

pub fn are_equivalent(a: &News, b: &News) -> bool {
    match (effective_guid(a), effective_guid(b)) {
        (Some(ga), Some(gb)) => ga == gb,
        _ => match (a.link.as_deref(), b.link.as_deref()) {
            (Some(la), Some(lb)) => la == lb,
            (None, None) if effective_guid(a).is_none() && effective_guid(b).is_none() => {
                !a.title.is_empty() && a.title == b.title && a.published_at == b.published_at
            }
            _ => false,
        },
    }
}

/// Position of the first candidate equivalent to `target`.
pub fn find_equivalent<'a, I>(target: &News, candidates: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a News>,
{
    candidates
        .into_iter()
        .position(|candidate| are_equivalent(target, candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Guid;
    use chrono::{TimeZone, Utc};

    fn samples() -> Vec<News> {
        let at = Utc.with_ymd_and_hms(2024, 10, 21, 7, 28, 0).unwrap();
        vec![
            News::new("a").with_guid(Guid::opaque("abc")).with_link("http://x/1"),
            News::new("b").with_link("http://x/1"),
            News::new("c").with_guid(Guid::permalink("abc")).with_link("http://x/2"),
            News::new("d").with_guid(Guid::permalink("abc")),
            News::new("e").with_guid(Guid::permalink("zzz")).with_link("http://x/1"),
            News::new("same").with_published(at),
            News::new("same").with_published(at),
            News::new(""),
            News::new("none"),
        ]
    }

    #[test]
    fn relation_is_symmetric() {
        let all = samples();
        for a in &all {
            for b in &all {
                assert_eq!(are_equivalent(a, b), are_equivalent(b, a));
            }
        }
    }

    #[test]
    fn opaque_guid_falls_back_to_link() {
        let all = samples();
        // opaque "abc" + link L matches a guid-less item with link L
        assert!(are_equivalent(&all[0], &all[1]));
        // ...but not a permalink "abc" on a different link
        assert!(!are_equivalent(&all[0], &all[2]));
    }

    #[test]
    fn permalink_guids_decide_when_both_present() {
        let all = samples();
        assert!(are_equivalent(&all[2], &all[3]));
        // same link, different permalink guids
        let other = News::new("x").with_guid(Guid::permalink("abc")).with_link("http://x/1");
        assert!(!are_equivalent(&all[4], &other));
    }

    #[test]
    fn permalink_against_linkless_guidless_is_not_equivalent() {
        let all = samples();
        assert!(!are_equivalent(&all[3], &all[8]));
    }

    #[test]
    fn title_and_date_match_linkless_items() {
        let all = samples();
        assert!(are_equivalent(&all[5], &all[6]));
        assert!(!are_equivalent(&all[5], &all[8]));
        // empty titles never match
        assert!(!are_equivalent(&all[7], &all[7].clone()));
    }

    #[test]
    fn find_equivalent_returns_first_match() {
        let all = samples();
        let target = News::new("t").with_link("http://x/1");
        assert_eq!(find_equivalent(&target, &all), Some(0));
        let missing = News::new("t").with_link("http://x/404");
        assert_eq!(find_equivalent(&missing, &all), None);
    }
}

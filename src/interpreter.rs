//! Parses fetched bytes into a transient `Feed`.
use chrono::{DateTime, Utc};

use crate::error::ParseError;
use crate::model::{Attachment, Category, Feed, Guid, Image, News, Person, Source};

pub trait Interpreter: Send + Sync {
    fn parse(&self, link: &str, bytes: &[u8]) -> Result<Feed, ParseError>;
}

/// RSS 0.9x/1.0/2.0 and Atom 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyndicationInterpreter;

impl Interpreter for SyndicationInterpreter {
    fn parse(&self, link: &str, bytes: &[u8]) -> Result<Feed, ParseError> {
        // each reader checks the root element itself, past any prolog,
        // comments or doctype
        let rss_err = match rss::Channel::read_from(bytes) {
            Ok(channel) => return Ok(from_rss(link, &channel, rss_format(bytes))),
            Err(err) => err,
        };
        match atom_syndication::Feed::read_from(bytes) {
            Ok(feed) => Ok(from_atom(link, &feed)),
            Err(atom_syndication::Error::InvalidStartTag) => match rss_err {
                rss::Error::InvalidStartTag => Err(ParseError::UnsupportedFormat(
                    "root element is neither rss, rdf:RDF nor feed".to_string(),
                )),
                err => Err(ParseError::Malformed(err.to_string())),
            },
            Err(err) => match rss_err {
                rss::Error::InvalidStartTag => Err(ParseError::Malformed(err.to_string())),
                rss_err => Err(ParseError::Malformed(rss_err.to_string())),
            },
        }
    }
}

fn rss_format(bytes: &[u8]) -> String {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    if head.contains("<rdf:RDF") || head.contains("<RDF") {
        return "RSS 1.0".to_string();
    }
    let version = head
        .find("<rss")
        .map(|i| &head[i..])
        .and_then(|root| root.find("version=").map(|i| &root[i + "version=".len()..]))
        .and_then(|v| {
            let quote = v.chars().next()?;
            let inner = &v[1..];
            inner.find(quote).map(|end| inner[..end].to_string())
        });
    match version {
        Some(v) => format!("RSS {v}"),
        None => "RSS".to_string(),
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn from_rss(link: &str, channel: &rss::Channel, format: String) -> Feed {
    let mut feed = Feed::new(link);
    feed.title = non_empty(channel.title());
    feed.description = non_empty(channel.description());
    feed.homepage = non_empty(channel.link());
    feed.format = Some(format);
    feed.language = channel.language().and_then(non_empty);
    feed.copyright = channel.copyright().and_then(non_empty);
    feed.generator = channel.generator().and_then(non_empty);
    feed.published_at = channel.pub_date().and_then(parse_date);
    feed.last_build_at = channel.last_build_date().and_then(parse_date);
    feed.image = channel
        .image()
        .map(|img| Image {
            url: non_empty(img.url()),
            title: non_empty(img.title()),
            link: non_empty(img.link()),
        })
        .filter(|img| *img != Image::default());
    feed.news = channel.items().iter().map(news_from_rss_item).collect();
    feed
}

fn news_from_rss_item(item: &rss::Item) -> News {
    let dc = item.dublin_core_ext();
    let mut news = News::new(item.title().and_then(non_empty).unwrap_or_default());
    news.link = item.link().and_then(non_empty);
    news.guid = item.guid().and_then(|g| {
        non_empty(g.value()).map(|value| Guid {
            value,
            is_permalink: g.is_permalink(),
        })
    });
    news.description = item
        .content()
        .and_then(non_empty)
        .or_else(|| item.description().and_then(non_empty));
    news.comments = item.comments().and_then(non_empty);
    news.published_at = item
        .pub_date()
        .and_then(parse_date)
        .or_else(|| dc.and_then(|dc| dc.dates().first()).and_then(|d| parse_date(d)));
    news.author = item
        .author()
        .and_then(non_empty)
        .or_else(|| dc.and_then(|dc| dc.creators().first()).and_then(|c| non_empty(c)))
        .map(|name| Person {
            name: Some(name),
            ..Default::default()
        });
    news.source = item.source().map(|s| Source {
        name: s.title().and_then(non_empty),
        link: non_empty(s.url()),
    });
    news.attachments = item
        .enclosure()
        .and_then(|e| {
            non_empty(e.url()).map(|link| Attachment {
                link,
                mime_type: non_empty(e.mime_type()),
                length: e.length().trim().parse().ok(),
            })
        })
        .into_iter()
        .collect();
    news.categories = item
        .categories()
        .iter()
        .filter_map(|c| {
            non_empty(c.name()).map(|name| Category {
                name,
                domain: c.domain().and_then(non_empty),
            })
        })
        .collect();
    news
}

fn atom_person(person: &atom_syndication::Person) -> Person {
    Person {
        name: non_empty(person.name()),
        email: person.email().and_then(non_empty),
        uri: person.uri().and_then(non_empty),
    }
}

/// `rel="alternate"` (or no rel) is the human-readable link.
fn atom_alternate(links: &[atom_syndication::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| links.first())
        .and_then(|l| non_empty(l.href()))
}

fn from_atom(link: &str, atom: &atom_syndication::Feed) -> Feed {
    let mut feed = Feed::new(link);
    feed.title = non_empty(&atom.title().value);
    feed.description = atom.subtitle().and_then(|t| non_empty(&t.value));
    feed.homepage = atom_alternate(atom.links());
    feed.format = Some("Atom 1.0".to_string());
    feed.language = atom.lang().and_then(non_empty);
    feed.copyright = atom.rights().and_then(|t| non_empty(&t.value));
    feed.generator = atom.generator().and_then(|g| non_empty(g.value()));
    feed.last_build_at = Some(atom.updated().with_timezone(&Utc));
    feed.image = atom.logo().and_then(non_empty).map(|url| Image {
        url: Some(url),
        ..Default::default()
    });
    feed.news = atom.entries().iter().map(news_from_atom_entry).collect();
    feed
}

fn news_from_atom_entry(entry: &atom_syndication::Entry) -> News {
    let mut news = News::new(non_empty(&entry.title().value).unwrap_or_default());
    news.link = atom_alternate(entry.links());
    // atom ids are required to be permanent and unique
    news.guid = non_empty(entry.id()).map(Guid::permalink);
    news.description = entry
        .content()
        .and_then(|c| c.value())
        .and_then(non_empty)
        .or_else(|| entry.summary().and_then(|t| non_empty(&t.value)));
    news.published_at = entry.published().map(|d| d.with_timezone(&Utc));
    news.modified_at = Some(entry.updated().with_timezone(&Utc));
    news.author = entry.authors().first().map(atom_person);
    news.attachments = entry
        .links()
        .iter()
        .filter(|l| l.rel() == "enclosure")
        .filter_map(|l| {
            non_empty(l.href()).map(|href| Attachment {
                link: href,
                mime_type: l.mime_type().and_then(non_empty),
                length: l.length().and_then(|len| len.trim().parse().ok()),
            })
        })
        .collect();
    news.categories = entry
        .categories()
        .iter()
        .filter_map(|c| {
            non_empty(c.term()).map(|name| Category {
                name,
                domain: c.scheme().and_then(non_empty),
            })
        })
        .collect();
    news
}

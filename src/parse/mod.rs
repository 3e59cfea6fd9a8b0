//! Feed parsing: bytes in, structured feed and entry data out.
//!
//! Parsing is a pure transformation with no I/O; the default implementation
//! covers Atom, RSS 0.9x/1.0/2.0 and JSON Feed through feed-rs.

use feed_rs::model::FeedType;
use feed_rs::parser as feed_parser;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Content, Enclosure, EntryData, FeedData};

pub trait Parser: Send + Sync {
    /// Parse a retrieved resource into feed-level data and its entries.
    fn parse(
        &self,
        url: &str,
        body: &[u8],
        media_type: Option<&str>,
    ) -> Result<(FeedData, Vec<EntryData>)>;

    /// Pass already-structured entries through unchanged, for re-rendering
    /// paths that skip retrieval.
    fn parse_entry_pairs(
        &self,
        _url: &str,
        entries: Vec<EntryData>,
    ) -> Result<(FeedData, Vec<EntryData>)> {
        Ok((FeedData::default(), entries))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }
}

impl Parser for FeedParser {
    fn parse(
        &self,
        url: &str,
        body: &[u8],
        _media_type: Option<&str>,
    ) -> Result<(FeedData, Vec<EntryData>)> {
        let feed = feed_parser::parse(body).map_err(|e| Error::Parse {
            url: url.to_string(),
            message: format!("failed to parse feed: {}", e),
            http_status: None,
        })?;

        let version = match feed.feed_type {
            FeedType::Atom => "atom",
            FeedType::JSON => "json",
            FeedType::RSS0 => "rss09",
            FeedType::RSS1 => "rss10",
            FeedType::RSS2 => "rss20",
        };
        let feed_data = FeedData {
            updated: feed.updated.or(feed.published),
            title: feed.title.map(|t| t.content),
            link: feed.links.first().map(|l| l.href.clone()),
            author: feed.authors.first().map(|a| a.name.clone()),
            subtitle: feed.description.map(|d| d.content),
            version: Some(version.to_string()),
        };

        let mut entries = Vec::with_capacity(feed.entries.len());
        for entry in feed.entries {
            if entry.id.is_empty() {
                warn!(url, "skipping entry without an id");
                continue;
            }

            let mut content = Vec::new();
            if let Some(body) = entry.content {
                if let Some(value) = body.body {
                    content.push(Content {
                        value,
                        media_type: Some(body.content_type.to_string()),
                        language: None,
                        is_summary: false,
                    });
                }
            }

            let mut enclosures = Vec::new();
            for link in &entry.links {
                if link.rel.as_deref() == Some("enclosure") {
                    enclosures.push(Enclosure {
                        href: link.href.clone(),
                        media_type: link.media_type.clone(),
                        length: link.length.map(|l| l as i64),
                    });
                }
            }
            for media in &entry.media {
                for item in &media.content {
                    if let Some(href) = &item.url {
                        let href = href.to_string();
                        if enclosures.iter().any(|e| e.href == href) {
                            continue;
                        }
                        enclosures.push(Enclosure {
                            href,
                            media_type: item.content_type.as_ref().map(|m| m.to_string()),
                            length: item.size.map(|s| s as i64),
                        });
                    }
                }
            }

            entries.push(EntryData {
                id: entry.id,
                updated: entry.updated,
                published: entry.published,
                title: entry.title.map(|t| t.content),
                link: entry.links.first().map(|l| l.href.clone()),
                author: entry.authors.first().map(|a| a.name.clone()),
                summary: entry.summary.map(|s| s.content),
                content,
                enclosures,
            });
        }

        Ok((feed_data, entries))
    }
}

// src/ingest/providers/rss.rs
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::config::{FeedConfig, FetchConfig};
use crate::error::{FetchError, ParseError};
use crate::ingest::normalize_text;
use crate::ingest::types::{FeedEntry, FeedSource};

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(default)]
    category: Vec<String>,
    #[serde(rename = "media:thumbnail", alias = "thumbnail", default)]
    thumbnail: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    #[serde(rename = "@url")]
    url: Option<String>,
}

/// RFC 2822 `pubDate` to UTC. Falls back to chrono for zone spellings `time` rejects.
pub fn parse_pub_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = OffsetDateTime::parse(ts, &Rfc2822) {
        let micros = i64::try_from(dt.unix_timestamp_nanos() / 1_000).ok()?;
        return DateTime::from_timestamp_micros(micros);
    }
    DateTime::parse_from_rfc2822(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A fetched feed whose `<item>` boundaries are known but whose items are not
/// decoded yet. `entries()` decodes lazily and can be called again to replay
/// the same sequence.
#[derive(Debug, Clone)]
pub struct RssDocument {
    feed: String,
    category: Option<String>,
    xml: String,
    items: Vec<Range<usize>>,
}

impl RssDocument {
    /// Scan the document once for `<item>` spans. Broken XML or a document
    /// without `<channel>` means the source is unusable.
    pub fn scan(feed: &str, category: Option<&str>, xml: String) -> Result<Self, FetchError> {
        let doc_err = |detail: String| FetchError::Document {
            feed: feed.to_string(),
            detail,
        };

        let mut items = Vec::new();
        let mut saw_channel = false;
        {
            let mut reader = Reader::from_str(&xml);
            loop {
                let start = reader.buffer_position() as usize;
                match reader.read_event() {
                    Ok(Event::Start(e)) => match e.local_name().as_ref() {
                        b"channel" => saw_channel = true,
                        b"item" => {
                            let end = e.to_end().into_owned();
                            reader
                                .read_to_end(end.name())
                                .map_err(|err| doc_err(err.to_string()))?;
                            items.push(start..reader.buffer_position() as usize);
                        }
                        _ => {}
                    },
                    Ok(Event::Empty(e)) if e.local_name().as_ref() == b"item" => {
                        items.push(start..reader.buffer_position() as usize);
                    }
                    Ok(Event::Eof) => break,
                    Ok(_) => {}
                    Err(err) => return Err(doc_err(err.to_string())),
                }
            }
        }
        if !saw_channel {
            return Err(doc_err("no <channel> element".to_string()));
        }

        Ok(Self {
            feed: feed.to_string(),
            category: category.map(str::to_string),
            xml,
            items,
        })
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<FeedEntry, ParseError>> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(move |(index, span)| self.decode(index, &self.xml[span.clone()]))
    }

    fn decode(&self, index: usize, fragment: &str) -> Result<FeedEntry, ParseError> {
        let t0 = std::time::Instant::now();
        let scrubbed = scrub_html_entities_for_xml(fragment);
        let item: Item = from_str(&scrubbed).map_err(|e| ParseError::Malformed {
            feed: self.feed.clone(),
            index,
            detail: e.to_string(),
        })?;
        let entry = self.to_entry(index, item);
        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        entry
    }

    fn to_entry(&self, index: usize, it: Item) -> Result<FeedEntry, ParseError> {
        let missing = |field: &'static str| ParseError::MissingField {
            feed: self.feed.clone(),
            index,
            field,
        };

        let link = non_empty(it.link);
        let id = it
            .guid
            .map(|g| g.value.trim().to_string())
            .filter(|g| !g.is_empty())
            .or_else(|| link.clone())
            .ok_or_else(|| missing("guid"))?;

        let title = normalize_text(it.title.as_deref().unwrap_or_default());
        if title.is_empty() {
            return Err(missing("title"));
        }

        let raw_date = it.pub_date.ok_or_else(|| missing("pubDate"))?;
        let published = parse_pub_date(&raw_date).ok_or_else(|| ParseError::BadTimestamp {
            feed: self.feed.clone(),
            index,
            value: raw_date.clone(),
        })?;

        let category = it
            .category
            .into_iter()
            .map(|c| c.trim().to_string())
            .find(|c| !c.is_empty())
            .or_else(|| self.category.clone());

        Ok(FeedEntry {
            id,
            title,
            published,
            body: normalize_text(it.description.as_deref().unwrap_or_default()),
            link,
            thumbnail_url: it.thumbnail.into_iter().find_map(|t| non_empty(t.url)),
            category,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct RssFeed {
    name: String,
    category: Option<String>,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl RssFeed {
    /// Serve a fixed document, e.g. a test fixture.
    pub fn from_fixture_str(name: &str, category: Option<&str>, s: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.map(str::to_string),
            mode: Mode::Fixture(s.to_string()),
        }
    }

    pub fn from_url(
        name: &str,
        category: Option<&str>,
        url: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.to_string(),
            category: category.map(str::to_string),
            mode: Mode::Http {
                url: url.to_string(),
                client,
            },
        }
    }

    /// One HTTP source per configured feed, sharing a client.
    pub fn from_config(feeds: &[FeedConfig], fetch: &FetchConfig) -> Result<Vec<Self>, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(fetch.user_agent.clone())
            .connect_timeout(Duration::from_secs(fetch.timeout_secs.min(10)))
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .build()
            .map_err(|e| FetchError::Transport {
                feed: "<client>".to_string(),
                source: e,
            })?;
        Ok(feeds
            .iter()
            .map(|f| {
                let category = (!f.category.is_empty()).then_some(f.category.as_str());
                let name = if f.category.is_empty() { &f.url } else { &f.category };
                Self::from_url(name, category, &f.url, client.clone())
            })
            .collect())
    }
}

#[async_trait]
impl FeedSource for RssFeed {
    async fn fetch(&self) -> Result<RssDocument, FetchError> {
        let category = self.category.as_deref();
        match &self.mode {
            Mode::Fixture(s) => RssDocument::scan(&self.name, category, s.clone()),
            Mode::Http { url, client } => {
                tracing::info!(feed = %self.name, url = %url, "fetching feed");
                let transport = |e| FetchError::Transport {
                    feed: self.name.clone(),
                    source: e,
                };
                let resp = client.get(url.as_str()).send().await.map_err(|e| {
                    counter!("ingest_fetch_errors_total").increment(1);
                    transport(e)
                })?;
                let status = resp.status();
                if !status.is_success() {
                    counter!("ingest_fetch_errors_total").increment(1);
                    return Err(FetchError::Status {
                        feed: self.name.clone(),
                        status: status.as_u16(),
                    });
                }
                let body = resp.text().await.map_err(transport)?;
                RssDocument::scan(&self.name, category, body)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

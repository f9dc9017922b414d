// src/ingest/types.rs
use chrono::{DateTime, Utc};

use crate::error::FetchError;
use crate::ingest::providers::rss::RssDocument;

/// One syndicated news item, immutable once produced by the collector.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FeedEntry {
    /// Stable per source item (`<guid>`, falling back to `<link>`).
    pub id: String,
    pub title: String,
    pub published: DateTime<Utc>,
    /// Normalized summary text.
    pub body: String,
    pub link: Option<String>,
    pub thumbnail_url: Option<String>,
    pub category: Option<String>,
}

#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    /// One request to the source. Only an unusable source is an error;
    /// malformed items surface later, per item, from the document.
    async fn fetch(&self) -> Result<RssDocument, FetchError>;
    fn name(&self) -> &str;
}

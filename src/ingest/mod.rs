// src/ingest/mod.rs
pub mod providers;
pub mod state;
pub mod types;

use crate::error::{FetchError, ParseError};
use crate::ingest::providers::rss::RssDocument;
use crate::ingest::state::ProcessedState;
use crate::ingest::types::{FeedEntry, FeedSource};
use metrics::{counter, describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use std::collections::HashSet;

const MAX_BODY_CHARS: usize = 4_000;

/// One-time metrics registration (so series show up in the exposition).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_items_total", "Feed items found in fetched documents.");
        describe_counter!(
            "ingest_parse_errors_total",
            "Feed items skipped because they could not be decoded."
        );
        describe_counter!(
            "ingest_seen_total",
            "Feed items dropped because their id was already processed."
        );
        describe_counter!(
            "ingest_candidates_total",
            "New entries handed to extraction."
        );
        describe_counter!("ingest_fetch_errors_total", "Feed transport failures.");
        describe_histogram!("ingest_parse_ms", "Per-item decode time in milliseconds.");
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > MAX_BODY_CHARS {
        out = out.chars().take(MAX_BODY_CHARS).collect();
    }

    out
}

/// New entries of one run, plus what was dropped on the way.
#[derive(Debug, Default)]
pub struct CandidateBatch {
    pub entries: Vec<FeedEntry>,
    pub skipped: Vec<ParseError>,
    /// Items whose id was already in the processed state.
    pub seen: usize,
    /// Items repeated across feeds (or within one) in this batch.
    pub duplicates: usize,
}

impl CandidateBatch {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }
}

/// Decode every document and keep entries that are neither processed nor
/// repeated. The first occurrence of an id wins, in document order.
pub fn filter_unseen(docs: &[RssDocument], seen: &ProcessedState) -> CandidateBatch {
    ensure_metrics_described();

    let mut batch = CandidateBatch::default();
    let mut in_batch: HashSet<String> = HashSet::new();

    for doc in docs {
        counter!("ingest_items_total").increment(doc.len() as u64);
        for item in doc.entries() {
            match item {
                Ok(entry) if seen.contains(&entry.id) => batch.seen += 1,
                Ok(entry) => {
                    if in_batch.insert(entry.id.clone()) {
                        batch.entries.push(entry);
                    } else {
                        batch.duplicates += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, feed = doc.feed(), "feed item skipped");
                    counter!("ingest_parse_errors_total").increment(1);
                    batch.skipped.push(e);
                }
            }
        }
    }

    counter!("ingest_seen_total").increment(batch.seen as u64);
    counter!("ingest_candidates_total").increment(batch.entries.len() as u64);
    batch
}

pub struct Collector {
    sources: Vec<Box<dyn FeedSource>>,
}

impl Collector {
    pub fn new(sources: Vec<Box<dyn FeedSource>>) -> Self {
        Self { sources }
    }

    /// Fetch every source, then filter against `seen`. Any unreachable source
    /// fails the whole call; nothing is considered seen in that case.
    pub async fn fetch_new(&self, seen: &ProcessedState) -> Result<CandidateBatch, FetchError> {
        ensure_metrics_described();

        let docs = futures::future::try_join_all(self.sources.iter().map(|s| s.fetch())).await?;
        for doc in &docs {
            tracing::debug!(feed = doc.feed(), items = doc.len(), "feed fetched");
        }

        let batch = filter_unseen(&docs, seen);
        tracing::info!(
            candidates = batch.entries.len(),
            seen = batch.seen,
            duplicates = batch.duplicates,
            skipped = batch.skipped.len(),
            "collected feed entries"
        );
        Ok(batch)
    }
}

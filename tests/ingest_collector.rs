// tests/ingest_collector.rs
use async_trait::async_trait;
use news_insights::error::{FetchError, ParseError};
use news_insights::ingest::providers::rss::{RssDocument, RssFeed};
use news_insights::ingest::state::StateTracker;
use news_insights::ingest::types::FeedSource;
use news_insights::ingest::Collector;

fn fixture(name: &str) -> String {
    std::fs::read_to_string(format!("tests/fixtures/{name}")).expect("fixture")
}

fn bbc_sources() -> Vec<Box<dyn FeedSource>> {
    vec![
        Box::new(RssFeed::from_fixture_str(
            "Business",
            Some("Business"),
            &fixture("bbc_business.xml"),
        )),
        Box::new(RssFeed::from_fixture_str(
            "Politics",
            Some("Politics"),
            &fixture("bbc_politics.xml"),
        )),
    ]
}

struct Unreachable;

#[async_trait]
impl FeedSource for Unreachable {
    async fn fetch(&self) -> Result<RssDocument, FetchError> {
        Err(FetchError::Status {
            feed: "Down".into(),
            status: 503,
        })
    }

    fn name(&self) -> &str {
        "Down"
    }
}

#[tokio::test]
async fn first_feed_wins_and_bad_items_are_skipped() {
    let collector = Collector::new(bbc_sources());
    let batch = collector.fetch_new(&Default::default()).await.unwrap();

    let ids: Vec<_> = batch.ids().collect();
    assert_eq!(
        ids,
        vec![
            "https://www.bbc.co.uk/news/articles/biz001#0",
            "https://www.bbc.co.uk/news/articles/biz002#0",
            "https://www.bbc.co.uk/news/articles/shared001#0",
            "https://www.bbc.co.uk/news/articles/pol001#0",
        ]
    );
    assert_eq!(batch.duplicates, 1);

    let shared = &batch.entries[2];
    assert_eq!(shared.category.as_deref(), Some("Business"));
    assert_eq!(
        shared.body,
        "Housing costs remain a worry for younger households - the Treasury says more is coming."
    );
    // Item-level <category> beats the feed label.
    assert_eq!(batch.entries[3].category.as_deref(), Some("Westminster"));

    assert_eq!(batch.skipped.len(), 2);
    assert!(matches!(
        &batch.skipped[0],
        ParseError::BadTimestamp { index: 2, value, .. } if value == "sometime last week"
    ));
    assert!(matches!(
        batch.skipped[1],
        ParseError::MissingField { index: 3, field: "guid", .. }
    ));
}

#[tokio::test]
async fn processed_ids_are_filtered() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = StateTracker::new(dir.path().join("state.json"));
    let base = tracker.load().unwrap();
    let state = tracker
        .commit(
            &base,
            [
                "https://www.bbc.co.uk/news/articles/biz001#0",
                "https://www.bbc.co.uk/news/articles/shared001#0",
            ],
        )
        .unwrap();

    let batch = Collector::new(bbc_sources()).fetch_new(&state).await.unwrap();
    let ids: Vec<_> = batch.ids().collect();
    assert_eq!(
        ids,
        vec![
            "https://www.bbc.co.uk/news/articles/biz002#0",
            "https://www.bbc.co.uk/news/articles/pol001#0",
        ]
    );
    // shared001 appears in both feeds, so it is counted as seen twice.
    assert_eq!(batch.seen, 3);
    assert_eq!(batch.duplicates, 0);
}

#[tokio::test]
async fn one_unreachable_feed_fails_the_fetch() {
    let mut sources = bbc_sources();
    sources.push(Box::new(Unreachable));
    let err = Collector::new(sources)
        .fetch_new(&Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 503, .. }));
}

#[tokio::test]
async fn no_sources_means_no_candidates() {
    let batch = Collector::new(Vec::new())
        .fetch_new(&Default::default())
        .await
        .unwrap();
    assert!(batch.entries.is_empty());
    assert!(batch.skipped.is_empty());
}

#[test]
fn non_feed_document_is_rejected() {
    let err = RssDocument::scan("Broken", None, "<html><body>maintenance</body></html>".into())
        .unwrap_err();
    assert!(matches!(err, FetchError::Document { .. }));
}

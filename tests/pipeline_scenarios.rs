// tests/pipeline_scenarios.rs
// End-to-end runs over fixture feeds, a scripted AI provider and a temp store.
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use news_insights::ai_adapter::{CallError, Prompt, Provider};
use news_insights::analyze::{Extractor, RetryPolicy};
use news_insights::error::{
    ExtractionFailure, FetchError, PipelineError, StateError, StorageError,
};
use news_insights::ingest::providers::rss::{RssDocument, RssFeed};
use news_insights::ingest::state::StateTracker;
use news_insights::ingest::types::FeedSource;
use news_insights::ingest::Collector;
use news_insights::store::records::{ActorTableRecord, RawNewsRecord};
use news_insights::store::VersionedStore;
use news_insights::{Pipeline, RunPhase, RunStatus};
use parking_lot::Mutex;

const BIZ001: &str = "https://www.bbc.co.uk/news/articles/biz001#0";
const BIZ002: &str = "https://www.bbc.co.uk/news/articles/biz002#0";
const SHARED001: &str = "https://www.bbc.co.uk/news/articles/shared001#0";
const CARMAKER: &str = "Carmaker names new chief executive";

/// Answers by headline (first prompt line). Unlisted headlines get one actor.
#[derive(Default)]
struct Newsroom {
    by_title: HashMap<String, Result<String, CallError>>,
    calls: Mutex<Vec<String>>,
}

impl Newsroom {
    fn with(mut self, title: &str, answer: Result<String, CallError>) -> Self {
        self.by_title.insert(title.to_string(), answer);
        self
    }

    fn calls_for(&self, title: &str) -> usize {
        self.calls.lock().iter().filter(|t| *t == title).count()
    }
}

impl Provider for Newsroom {
    fn complete<'a>(
        &'a self,
        prompt: &'a Prompt,
    ) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        let title = prompt.user.lines().next().unwrap_or_default().to_string();
        self.calls.lock().push(title.clone());
        let out = self.by_title.get(&title).cloned().unwrap_or_else(|| {
            Ok(format!(
                concat!(
                    r#"[{{"actor_name":"Actor of {title}","actor_role":"Main subject","#,
                    r#""is_main_actor":true,"category":"Others"}}]"#,
                ),
                title = title
            ))
        });
        Box::pin(async move { out })
    }

    fn name(&self) -> &'static str {
        "newsroom"
    }
}

struct Unreachable;

#[async_trait]
impl FeedSource for Unreachable {
    async fn fetch(&self) -> Result<RssDocument, FetchError> {
        Err(FetchError::Status {
            feed: "Health".into(),
            status: 502,
        })
    }

    fn name(&self) -> &str {
        "Health"
    }
}

fn fixture(name: &str) -> String {
    fs::read_to_string(format!("tests/fixtures/{name}")).expect("fixture")
}

fn business() -> Vec<Box<dyn FeedSource>> {
    vec![Box::new(RssFeed::from_fixture_str(
        "Business",
        Some("Business"),
        &fixture("bbc_business.xml"),
    ))]
}

fn business_and_politics() -> Vec<Box<dyn FeedSource>> {
    let mut v = business();
    v.push(Box::new(RssFeed::from_fixture_str(
        "Politics",
        Some("Politics"),
        &fixture("bbc_politics.xml"),
    )));
    v
}

fn pipeline(dir: &Path, sources: Vec<Box<dyn FeedSource>>, ai: Arc<Newsroom>) -> Pipeline {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        call_timeout: Duration::from_secs(2),
    };
    Pipeline::new(
        StateTracker::new(dir.join("rss_state.json")),
        Collector::new(sources),
        Extractor::new(ai, policy, 2),
        VersionedStore::open(dir.join("store")).unwrap(),
    )
}

fn raw_ids(p: &Pipeline) -> Vec<String> {
    let mut ids: Vec<_> = p
        .store()
        .read_table::<RawNewsRecord>(None)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn new_entries_are_committed_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai);

    let report = p.run().await.unwrap();
    assert_eq!(p.phase(), RunPhase::Done);
    assert_eq!(report.phase, RunPhase::Done);
    assert_eq!(report.status(), RunStatus::Success);
    assert_eq!(report.candidates, 3);
    assert_eq!(report.raw_rows, 3);
    assert_eq!(report.actor_rows, 3);
    assert_eq!(report.version, Some(0));
    assert_eq!(report.state_size, 3);

    assert_eq!(raw_ids(&p), vec![BIZ001, BIZ002, SHARED001]);
    let state = p.tracker().load().unwrap();
    assert_eq!(state.len(), 3);

    let actors = p.store().read_table::<ActorTableRecord>(None).unwrap();
    let biz001 = actors.iter().find(|a| a.news_id == BIZ001).unwrap();
    assert_eq!(
        biz001.actor_name,
        "Actor of Bank of England holds interest rates at 4%"
    );
    assert_eq!(biz001.category.as_deref(), Some("Others"));
}

#[tokio::test]
async fn rerun_over_the_same_feed_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai.clone());

    p.run().await.unwrap();
    let before = p.store().snapshot(None).unwrap();

    let report = p.run().await.unwrap();
    assert_eq!(report.status(), RunStatus::Success);
    assert_eq!(report.candidates, 0);
    assert_eq!(report.raw_rows, 0);
    assert_eq!(report.version, None);
    assert_eq!(p.store().snapshot(None).unwrap(), before);
    assert_eq!(ai.calls.lock().len(), 3);
}

#[tokio::test]
async fn permanently_failing_entry_is_stored_raw_only() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default().with(CARMAKER, Err(CallError::Server(503))));
    let mut p = pipeline(dir.path(), business(), ai.clone());

    let report = p.run().await.unwrap();
    assert_eq!(report.phase, RunPhase::Done);
    assert_eq!(report.status(), RunStatus::Degraded);
    assert_eq!(report.status().exit_code(), 2);
    assert_eq!(report.raw_rows, 3);
    assert_eq!(report.actor_rows, 2);
    assert!(matches!(
        report.degraded.get(BIZ002),
        Some(ExtractionFailure::Exhausted { attempts: 3, .. })
    ));
    assert_eq!(ai.calls_for(CARMAKER), 3);

    // The failed entry is still marked processed.
    assert!(p.tracker().load().unwrap().contains(BIZ002));
    let actors = p.store().read_table::<ActorTableRecord>(None).unwrap();
    assert!(actors.iter().all(|a| a.news_id != BIZ002));

    // And it is not offered again.
    let again = p.run().await.unwrap();
    assert_eq!(again.candidates, 0);
    assert_eq!(ai.calls_for(CARMAKER), 3);
}

#[tokio::test]
async fn malformed_answer_only_affects_its_own_entry() {
    let dir = tempfile::tempdir().unwrap();
    let refusal = Ok("Sorry, I can't help with that.".into());
    let ai = Arc::new(Newsroom::default().with(CARMAKER, refusal));
    let mut p = pipeline(dir.path(), business(), ai.clone());

    let report = p.run().await.unwrap();
    assert_eq!(report.degraded.len(), 1);
    assert!(matches!(
        report.degraded.get(BIZ002),
        Some(ExtractionFailure::Schema(_))
    ));
    assert_eq!(report.actor_rows, 2);
    // Schema failures are not retried.
    assert_eq!(ai.calls_for(CARMAKER), 1);
}

#[tokio::test]
async fn failed_commit_changes_nothing_and_the_next_run_retries() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai);

    let actors_dir = dir.path().join("store").join("actors");
    fs::remove_dir_all(&actors_dir).unwrap();
    fs::write(&actors_dir, b"").unwrap();

    let err = p.run().await.unwrap_err();
    assert_eq!(p.phase(), RunPhase::Failed);
    assert_eq!(err.phase(), RunPhase::Committing);
    assert!(matches!(
        err,
        PipelineError::Storage {
            source: StorageError::Io { .. },
            ..
        }
    ));
    assert!(!dir.path().join("rss_state.json").exists());
    assert!(p.store().versions().unwrap().is_empty());
    assert!(raw_ids(&p).is_empty());

    fs::remove_file(&actors_dir).unwrap();
    fs::create_dir(&actors_dir).unwrap();

    let report = p.run().await.unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.raw_rows, 3);
    assert_eq!(p.tracker().load().unwrap().len(), 3);
}

#[tokio::test]
async fn unreachable_feed_fails_the_run_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut sources = business();
    sources.push(Box::new(Unreachable));
    let mut p = pipeline(dir.path(), sources, ai.clone());

    let err = p.run().await.unwrap_err();
    assert_eq!(p.phase(), RunPhase::Failed);
    assert_eq!(err.phase(), RunPhase::Fetching);
    assert!(!err.is_retryable());
    assert!(matches!(
        err,
        PipelineError::Fetch {
            source: FetchError::Status { status: 502, .. },
            ..
        }
    ));

    assert!(!dir.path().join("rss_state.json").exists());
    assert!(p.store().versions().unwrap().is_empty());
    assert!(ai.calls.lock().is_empty());
}

#[tokio::test]
async fn unreachable_state_file_aborts_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("rss_state.json"), "{ not json").unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai.clone());

    let err = p.run().await.unwrap_err();
    assert_eq!(err.phase(), RunPhase::Fetching);
    assert!(matches!(
        err,
        PipelineError::State {
            source: StateError::Corrupt { .. },
            ..
        }
    ));
    assert!(ai.calls.lock().is_empty());
    assert_eq!(
        fs::read_to_string(dir.path().join("rss_state.json")).unwrap(),
        "{ not json"
    );
}

#[tokio::test]
async fn entries_committed_before_a_crash_are_not_stored_twice() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai.clone());

    // An earlier run got as far as the store commit and died before the
    // state file was written.
    let earlier = RawNewsRecord {
        id: BIZ001.to_string(),
        title: "Bank of England holds interest rates at 4%".to_string(),
        published_time: chrono::DateTime::from_timestamp(1_792_044_720, 0).unwrap(),
        body: "earlier".to_string(),
        link: None,
        thumbnail_url: None,
        category: Some("Business".to_string()),
    };
    p.store().commit_batch(&[earlier], &[]).unwrap();

    let report = p.run().await.unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.raw_rows, 2);
    assert_eq!(report.state_size, 3);
    assert_eq!(ai.calls.lock().len(), 2);
    assert_eq!(raw_ids(&p), vec![BIZ001, BIZ002, SHARED001]);

    let check = p.verify().unwrap();
    assert!(check.is_consistent());
    assert!(check.unadvanced.is_empty());
}

#[tokio::test]
async fn overlapping_feeds_store_each_story_once() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business_and_politics(), ai);

    let report = p.run().await.unwrap();
    assert_eq!(report.candidates, 4);
    assert_eq!(report.skipped_items.len(), 2);
    assert_eq!(report.raw_rows, 4);

    let raw = p.store().read_table::<RawNewsRecord>(None).unwrap();
    let shared: Vec<_> = raw.iter().filter(|r| r.id == SHARED001).collect();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].category.as_deref(), Some("Business"));
}

#[tokio::test]
async fn verify_reports_processed_ids_without_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ai = Arc::new(Newsroom::default());
    let mut p = pipeline(dir.path(), business(), ai);
    p.run().await.unwrap();

    let ok = p.verify().unwrap();
    assert!(ok.is_consistent());
    assert_eq!(ok.state_ids, 3);
    assert_eq!(ok.raw_rows, 3);

    // Someone hand-edits the state file.
    let tracker = StateTracker::new(dir.path().join("rss_state.json"));
    let base = tracker.load().unwrap();
    tracker.commit(&base, ["https://example.test/ghost"]).unwrap();

    let bad = p.verify().unwrap();
    assert!(!bad.is_consistent());
    assert_eq!(bad.missing, vec!["https://example.test/ghost".to_string()]);
}

//! # Pipeline Orchestrator
//! One run: fetch → filter → extract → commit → advance state.
//!
//! The processed-state file is only ever written after the store commit
//! succeeded, so every id in it has its `raw` row. A run that fails anywhere
//! leaves both the state file and the store as they were.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::Instrument;

use crate::analyze::ai_adapter::build_provider;
use crate::analyze::{ExtractionResult, Extractor};
use crate::config::PipelineConfig;
use crate::error::{ExtractionFailure, ParseError, PipelineError};
use crate::ingest::providers::rss::RssFeed;
use crate::ingest::state::StateTracker;
use crate::ingest::types::{FeedEntry, FeedSource};
use crate::ingest::Collector;
use crate::store::records::{ActorTableRecord, RawNewsRecord};
use crate::store::VersionedStore;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline runs, by outcome.");
        describe_gauge!("pipeline_last_run_ts", "Unix ts when the pipeline last finished a run.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Fetching,
    Extracting,
    Committing,
    AdvancingState,
    Done,
    Failed,
}

/// How a run ended, as the run trigger reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Done, but some entries got no actor rows.
    Degraded,
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Degraded => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Degraded => "degraded",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub phase: RunPhase,
    /// New entries found this run.
    pub candidates: usize,
    /// Candidates already in `raw` from an earlier run that never advanced state.
    pub recovered: usize,
    pub skipped_items: Vec<ParseError>,
    pub raw_rows: usize,
    pub actor_rows: usize,
    pub version: Option<u64>,
    /// Entries committed raw-only, with the reason extraction failed.
    pub degraded: BTreeMap<String, ExtractionFailure>,
    pub state_size: usize,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.degraded.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Degraded
        }
    }
}

/// Result of comparing the state file with `raw`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub state_ids: usize,
    pub raw_rows: usize,
    /// In state, but no `raw` row.
    pub missing: Vec<String>,
    /// More than one `raw` row.
    pub duplicated: Vec<String>,
    /// In `raw`, not yet in state (the next run picks these up).
    pub unadvanced: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.duplicated.is_empty()
    }
}

pub struct Pipeline {
    tracker: StateTracker,
    collector: Collector,
    extractor: Extractor,
    store: VersionedStore,
    phase: RunPhase,
}

impl Pipeline {
    pub fn new(
        tracker: StateTracker,
        collector: Collector,
        extractor: Extractor,
        store: VersionedStore,
    ) -> Self {
        Self {
            tracker,
            collector,
            extractor,
            store,
            phase: RunPhase::Idle,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> anyhow::Result<Self> {
        let sources = RssFeed::from_config(&cfg.feeds, &cfg.fetch)?
            .into_iter()
            .map(|f| Box::new(f) as Box<dyn FeedSource>)
            .collect();
        let provider = build_provider(&cfg.ai)?;
        tracing::info!(
            provider = provider.name(),
            model = %cfg.ai.model,
            feeds = cfg.feeds.len(),
            "pipeline configured"
        );
        Ok(Self::new(
            StateTracker::new(&cfg.state_file),
            Collector::new(sources),
            Extractor::from_config(provider, &cfg.extraction),
            VersionedStore::open(&cfg.store_root)?,
        ))
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    fn enter(&mut self, next: RunPhase) {
        tracing::info!(from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
    }

    /// Execute exactly one cycle.
    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        ensure_metrics_described();
        self.phase = RunPhase::Idle;

        let run_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let span = tracing::info_span!("run", run_id = %run_id);
        let result = self.run_inner(run_id).instrument(span).await;

        let status = match &result {
            Ok(report) => report.status(),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    phase = ?e.phase(),
                    retryable = e.is_retryable(),
                    "run failed"
                );
                self.phase = RunPhase::Failed;
                RunStatus::Failed
            }
        };
        counter!("pipeline_runs_total", "outcome" => status.label()).increment(1);
        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        result
    }

    async fn run_inner(&mut self, run_id: String) -> Result<RunReport, PipelineError> {
        // FETCHING: load state, fetch, filter. Read-only.
        self.enter(RunPhase::Fetching);
        let state = self.tracker.load().map_err(|source| PipelineError::State {
            phase: RunPhase::Fetching,
            source,
        })?;
        let batch = self
            .collector
            .fetch_new(&state)
            .await
            .map_err(|source| PipelineError::Fetch {
                phase: RunPhase::Fetching,
                source,
            })?;
        let stored = self.store.committed_ids().map_err(|source| PipelineError::Storage {
            phase: RunPhase::Fetching,
            source,
        })?;
        let (recovered, fresh): (Vec<&FeedEntry>, Vec<&FeedEntry>) =
            batch.entries.iter().partition(|e| stored.contains(&e.id));
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                "entries already stored by an earlier run; advancing state only"
            );
        }

        // EXTRACTING: never fails the run.
        self.enter(RunPhase::Extracting);
        let fresh: Vec<FeedEntry> = fresh.into_iter().cloned().collect();
        let results = self.extractor.extract_all(&fresh).await;

        // COMMITTING
        self.enter(RunPhase::Committing);
        let (raw, actors, degraded) = assemble_rows(&fresh, &results);
        let version = self
            .store
            .commit_batch(&raw, &actors)
            .map_err(|source| PipelineError::Storage {
                phase: RunPhase::Committing,
                source,
            })?;

        // ADVANCING_STATE: every id of the batch, whatever its extraction outcome.
        self.enter(RunPhase::AdvancingState);
        let state_size = if batch.entries.is_empty() {
            state.len()
        } else {
            self.tracker
                .commit(&state, batch.ids())
                .map_err(|source| PipelineError::State {
                    phase: RunPhase::AdvancingState,
                    source,
                })?
                .len()
        };

        self.enter(RunPhase::Done);
        let report = RunReport {
            run_id,
            phase: RunPhase::Done,
            candidates: batch.entries.len(),
            recovered: recovered.len(),
            skipped_items: batch.skipped,
            raw_rows: raw.len(),
            actor_rows: actors.len(),
            version,
            degraded,
            state_size,
        };
        tracing::info!(
            candidates = report.candidates,
            raw_rows = report.raw_rows,
            actor_rows = report.actor_rows,
            degraded = report.degraded.len(),
            skipped = report.skipped_items.len(),
            version = ?report.version,
            "run done"
        );
        Ok(report)
    }

    /// Check that every processed id has exactly one `raw` row.
    pub fn verify(&self) -> Result<ConsistencyReport, PipelineError> {
        let state = self.tracker.load().map_err(|source| PipelineError::State {
            phase: RunPhase::Idle,
            source,
        })?;
        let raw = self
            .store
            .read_table::<RawNewsRecord>(None)
            .map_err(|source| PipelineError::Storage {
                phase: RunPhase::Idle,
                source,
            })?;

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for r in &raw {
            *counts.entry(r.id.as_str()).or_default() += 1;
        }
        let in_state: HashSet<&str> = state.ids().collect();

        let mut report = ConsistencyReport {
            state_ids: state.len(),
            raw_rows: raw.len(),
            missing: state
                .ids()
                .filter(|id| !counts.contains_key(id))
                .map(str::to_string)
                .collect(),
            duplicated: counts
                .iter()
                .filter(|(_, n)| **n > 1)
                .map(|(id, _)| id.to_string())
                .collect(),
            unadvanced: counts
                .keys()
                .filter(|id| !in_state.contains(*id))
                .map(|id| id.to_string())
                .collect(),
        };
        report.duplicated.sort();
        report.unadvanced.sort();
        Ok(report)
    }
}

/// Raw rows for every entry; actor rows only where extraction succeeded.
/// Results are matched to entries by id.
fn assemble_rows(
    entries: &[FeedEntry],
    results: &BTreeMap<String, ExtractionResult>,
) -> (
    Vec<RawNewsRecord>,
    Vec<ActorTableRecord>,
    BTreeMap<String, ExtractionFailure>,
) {
    let mut raw = Vec::with_capacity(entries.len());
    let mut actors = Vec::new();
    let mut degraded = BTreeMap::new();

    for entry in entries {
        raw.push(RawNewsRecord::from(entry));
        match results.get(&entry.id).map(|r| &r.outcome) {
            Some(Ok(found)) => actors.extend(found.iter().map(ActorTableRecord::from)),
            Some(Err(failure)) => {
                degraded.insert(entry.id.clone(), failure.clone());
            }
            None => {
                degraded.insert(
                    entry.id.clone(),
                    ExtractionFailure::Rejected("no extraction result".to_string()),
                );
            }
        }
    }
    (raw, actors, degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ActorRecord;

    fn entry(id: &str) -> FeedEntry {
        FeedEntry {
            id: id.to_string(),
            title: format!("title {id}"),
            published: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            body: "body".to_string(),
            link: None,
            thumbnail_url: None,
            category: None,
        }
    }

    #[test]
    fn rows_are_correlated_by_id_not_position() {
        let entries = vec![entry("a"), entry("b"), entry("c")];
        let mut results = BTreeMap::new();
        // Inserted in a different order than the entries.
        results.insert(
            "c".to_string(),
            ExtractionResult {
                news_id: "c".into(),
                attempts: 1,
                outcome: Ok(vec![ActorRecord {
                    news_id: "c".into(),
                    name: "C Corp".into(),
                    role: "r".into(),
                    is_main_actor: true,
                    category: None,
                }]),
            },
        );
        results.insert(
            "a".to_string(),
            ExtractionResult {
                news_id: "a".into(),
                attempts: 4,
                outcome: Err(ExtractionFailure::Exhausted {
                    attempts: 4,
                    last: "timed out".into(),
                }),
            },
        );

        let (raw, actors, degraded) = assemble_rows(&entries, &results);
        assert_eq!(raw.len(), 3);
        assert_eq!(actors.len(), 1);
        assert_eq!(actors[0].news_id, "c");
        assert_eq!(degraded.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Degraded.exit_code(), 2);
    }
}

//! Per-entry extraction with bounded retries, run over a bounded worker pool.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;

use crate::analyze::ai_adapter::{CallError, DynProvider, Prompt};
use crate::analyze::schema::validate_payload;
use crate::analyze::ExtractionResult;
use crate::config::ExtractionConfig;
use crate::error::ExtractionFailure;
use crate::ingest::types::FeedEntry;

const SYSTEM_PROMPT: &str = "Identify the actors involved in the news article. \
Then, analyze the content and classify the news into these categories: \
Political Turmoil, New Product Announced, Leadership Change, Housing Issues, or Others. \
Answer with JSON only: an object with an `actors` list, each actor having \
`actor_name`, `actor_role`, `is_main_actor` and `category`.";

const EXAMPLE_USER: &str =
    "Apple unveils new iPhone\nApple has announced the launch of its latest handset.";
const EXAMPLE_ANSWER: &str = concat!(
    r#"{"actors":[{"actor_name":"Apple","#,
    r#""actor_role":"Company announcing a new product launch","#,
    r#""is_main_actor":true,"category":"New Product Announced"}]}"#,
);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("extract_calls_total", "AI calls issued, retries included.");
        describe_counter!("extract_retries_total", "AI calls retried after a transient error.");
        describe_counter!("extract_failures_total", "Entries whose extraction failed.");
        describe_histogram!("extract_call_ms", "AI call latency in milliseconds.");
    });
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-call budget; a call that exceeds it counts as a transient timeout.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &ExtractionConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
            call_timeout: cfg.call_timeout(),
        }
    }

    /// Wait before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    /// A server hint is honoured but still capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << shift);
        backoff.max(hint.unwrap_or_default()).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}

pub struct Extractor {
    provider: DynProvider,
    policy: RetryPolicy,
    max_in_flight: usize,
}

impl Extractor {
    pub fn new(provider: DynProvider, policy: RetryPolicy, max_in_flight: usize) -> Self {
        Self {
            provider,
            policy,
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn from_config(provider: DynProvider, cfg: &ExtractionConfig) -> Self {
        Self::new(provider, RetryPolicy::from_config(cfg), cfg.max_in_flight)
    }

    pub fn build_prompt(entry: &FeedEntry) -> Prompt {
        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            examples: vec![(EXAMPLE_USER.to_string(), EXAMPLE_ANSWER.to_string())],
            user: format!("{}\n{}", entry.title, entry.body),
        }
    }

    /// Never fails: every problem becomes the entry's `ExtractionFailure`.
    pub async fn extract(&self, entry: &FeedEntry) -> ExtractionResult {
        ensure_metrics_described();

        let prompt = Self::build_prompt(entry);
        let (attempts, outcome) = match self.call_with_retry(&entry.id, &prompt).await {
            (attempts, Ok(raw)) => (attempts, validate_payload(&entry.id, &raw)),
            (attempts, Err(failure)) => (attempts, Err(failure)),
        };

        if let Err(failure) = &outcome {
            counter!("extract_failures_total").increment(1);
            tracing::warn!(news_id = %entry.id, attempts, error = %failure, "extraction failed");
        } else {
            tracing::debug!(news_id = %entry.id, attempts, "extraction succeeded");
        }

        ExtractionResult {
            news_id: entry.id.clone(),
            attempts,
            outcome,
        }
    }

    async fn call_with_retry(
        &self,
        news_id: &str,
        prompt: &Prompt,
    ) -> (u32, Result<String, ExtractionFailure>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            counter!("extract_calls_total").increment(1);

            let t0 = Instant::now();
            let call = self.provider.complete(prompt);
            let res = match tokio::time::timeout(self.policy.call_timeout, call).await {
                Ok(res) => res,
                Err(_elapsed) => Err(CallError::Timeout),
            };
            histogram!("extract_call_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

            let err = match res {
                Ok(raw) => return (attempt, Ok(raw)),
                Err(e) => e,
            };

            if !err.is_transient() {
                let failure = match err {
                    CallError::Malformed(detail) => ExtractionFailure::Schema(detail),
                    other => ExtractionFailure::Rejected(other.to_string()),
                };
                return (attempt, Err(failure));
            }
            if attempt >= self.policy.max_attempts {
                return (
                    attempt,
                    Err(ExtractionFailure::Exhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    }),
                );
            }

            let delay = self.policy.delay_after(attempt, err.retry_after());
            counter!("extract_retries_total").increment(1);
            tracing::debug!(
                news_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying AI call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Extract every entry with at most `max_in_flight` calls outstanding.
    /// Results are keyed by entry id, whatever order they finish in.
    pub async fn extract_all(&self, entries: &[FeedEntry]) -> BTreeMap<String, ExtractionResult> {
        stream::iter(entries)
            .map(|entry| self.extract(entry))
            .buffer_unordered(self.max_in_flight)
            .map(|result| (result.news_id.clone(), result))
            .collect()
            .await
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay_after(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_after(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_after(3, None), Duration::from_millis(350));
        assert_eq!(p.delay_after(40, None), Duration::from_millis(350));
        assert_eq!(
            p.delay_after(1, Some(Duration::from_millis(300))),
            Duration::from_millis(300)
        );
        assert_eq!(
            p.delay_after(1, Some(Duration::from_secs(60))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn prompt_combines_title_and_body() {
        let entry = FeedEntry {
            id: "x".into(),
            title: "Title".into(),
            published: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            body: "Body".into(),
            link: None,
            thumbnail_url: None,
            category: None,
        };
        let p = Extractor::build_prompt(&entry);
        assert_eq!(p.user, "Title\nBody");
        assert_eq!(p.examples.len(), 1);
    }
}

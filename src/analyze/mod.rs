// src/analyze/mod.rs
//! Actor extraction: AI provider adapter, payload validation, retrying worker pool.

pub mod ai_adapter;
pub mod extract;
pub mod schema;

use serde::{Deserialize, Serialize};

use crate::error::ExtractionFailure;

pub use crate::analyze::extract::{Extractor, RetryPolicy};
pub use crate::analyze::schema::EventCategory;

/// One actor the service found in an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub news_id: String,
    pub name: String,
    /// Free-text role, as inferred by the model.
    pub role: String,
    pub is_main_actor: bool,
    pub category: Option<EventCategory>,
}

/// Outcome of extracting one entry. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub news_id: String,
    /// AI calls made, including retries.
    pub attempts: u32,
    pub outcome: Result<Vec<ActorRecord>, ExtractionFailure>,
}

impl ExtractionResult {
    pub fn actors(&self) -> &[ActorRecord] {
        match &self.outcome {
            Ok(actors) => actors,
            Err(_) => &[],
        }
    }

    pub fn failure(&self) -> Option<&ExtractionFailure> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

// src/lib.rs
// Library surface shared by the `news-insights` binary and the integration tests.

pub mod analyze;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod store;
pub mod telemetry;

// ---- Re-exports for the common entry points ----
pub use analyze::ai_adapter;
pub use config::PipelineConfig;
pub use error::{
    ExtractionFailure, FetchError, ParseError, PipelineError, StateError, StorageError,
};
pub use pipeline::{ConsistencyReport, Pipeline, RunPhase, RunReport, RunStatus};

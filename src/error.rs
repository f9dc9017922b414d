//! Error taxonomy for one pipeline run.
//!
//! Entry-scoped errors (`ParseError`, `ExtractionFailure`) are contained and end up
//! in the run report. Run-scoped errors (`FetchError`, `StorageError`, `StateError`)
//! abort the run before any durable state changes.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::RunPhase;

/// Feed source could not be used at all. Fatal to the run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed {feed} unreachable: {source}")]
    Transport {
        feed: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("feed {feed} answered HTTP {status}")]
    Status { feed: String, status: u16 },
    #[error("feed {feed} is not a readable syndication document: {detail}")]
    Document { feed: String, detail: String },
}

/// A single malformed feed item. Skipped, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("item #{index} in {feed}: {detail}")]
    Malformed {
        feed: String,
        index: usize,
        detail: String,
    },
    #[error("item #{index} in {feed}: missing {field}")]
    MissingField {
        feed: String,
        index: usize,
        field: &'static str,
    },
    #[error("item #{index} in {feed}: unparseable pubDate {value:?}")]
    BadTimestamp {
        feed: String,
        index: usize,
        value: String,
    },
}

/// Why an entry produced no actor rows. Recorded, not fatal to the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionFailure {
    /// The service answered, but the payload did not match the actor schema.
    #[error("response failed schema validation: {0}")]
    Schema(String),
    /// Every attempt hit a transient error.
    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: String },
    /// The service refused the request outright (auth, bad request, ...).
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("schema mismatch in table {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("table {table} already holds key {key}")]
    DuplicateKey { table: String, key: String },
    #[error("version {version} was committed concurrently")]
    Conflict { version: u64 },
    #[error("no version {0} in the store")]
    UnknownVersion(u64),
    #[error("corrupt store file {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },
    #[error("store I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file {} changed since it was loaded", path.display())]
    Conflict { path: PathBuf },
    #[error("state file is being committed by another run (lock {})", lock.display())]
    Busy { lock: PathBuf },
    #[error("state I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Conflict { .. } | StateError::Busy { .. })
    }
}

/// Run-scoped failure, tagged with the phase the run was in.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{phase:?}: {source}")]
    Fetch {
        phase: RunPhase,
        #[source]
        source: FetchError,
    },
    #[error("{phase:?}: {source}")]
    Storage {
        phase: RunPhase,
        #[source]
        source: StorageError,
    },
    #[error("{phase:?}: {source}")]
    State {
        phase: RunPhase,
        #[source]
        source: StateError,
    },
}

impl PipelineError {
    pub fn phase(&self) -> RunPhase {
        match self {
            PipelineError::Fetch { phase, .. }
            | PipelineError::Storage { phase, .. }
            | PipelineError::State { phase, .. } => *phase,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Fetch { .. } => false,
            PipelineError::Storage { source, .. } => source.is_retryable(),
            PipelineError::State { source, .. } => source.is_retryable(),
        }
    }
}

//! Error types for the merge and index pipeline

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Malformed record at {}:{line}: {cause}", path.display())]
    InvalidRecord {
        path: PathBuf,
        line: usize,
        cause: serde_json::Error,
    },

    #[error("Record {record} has no usable '{field}' field")]
    MissingField { field: String, record: String },

    #[error("Dangling reference: {field} '{id}' does not match any node")]
    MissingReference { field: String, id: String },

    #[error("Collection '{name}' not found (available: {available:?})")]
    CollectionNotFound { name: String, available: Vec<String> },

    #[error(
        "Node collection '{collection}' not found in database '{database}' (discovered: {discovered:?})"
    )]
    MissingNodeCollection {
        collection: String,
        database: String,
        discovered: Vec<String>,
    },

    #[error("Batch #{batch} failed while merging source '{source_name}' [{reason}]")]
    BatchFailed {
        batch: usize,
        source_name: String,
        reason: String,
    },

    #[error("{failed} batch(es) failed while merging source '{source_name}', first: {first}")]
    SomeBatchesFailed {
        source_name: String,
        failed: usize,
        first: String,
    },

    #[error("Scheduler mismatch: finished {finished} of {total} ({context})")]
    SchedulerMismatch {
        total: usize,
        finished: usize,
        context: String,
    },

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Search sink error: {0}")]
    Sink(String),

    #[error("Unknown merge strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown index mode: {0}")]
    UnknownMode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stable error code used in log lines and diagnostic dumps
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Io(_) => "IO",
            PipelineError::Json(_) | PipelineError::Yaml(_) => "SERIALIZATION",
            PipelineError::InvalidRecord { .. } => "INVALID_RECORD",
            PipelineError::MissingField { .. } => "MISSING_FIELD",
            PipelineError::MissingReference { .. } => "MISSING_REFERENCE",
            PipelineError::CollectionNotFound { .. } => "COLLECTION_NOT_FOUND",
            PipelineError::MissingNodeCollection { .. } => "MISSING_NODE_COLLECTION",
            PipelineError::BatchFailed { .. } => "BATCH_FAILED",
            PipelineError::SomeBatchesFailed { .. } => "SOME_BATCHES_FAILED",
            PipelineError::SchedulerMismatch { .. } => "SCHEDULER_MISMATCH",
            PipelineError::Cancelled(_) => "CANCELLED",
            PipelineError::WorkerPanicked(_) => "WORKER_PANICKED",
            PipelineError::Store(_) => "STORE",
            PipelineError::Sink(_) => "SINK",
            PipelineError::UnknownStrategy(_) => "UNKNOWN_STRATEGY",
            PipelineError::UnknownMode(_) => "UNKNOWN_MODE",
            PipelineError::Config(_) => "INVALID_CONFIG",
        }
    }

    /// True for the fatal, non-batch conditions raised while wiring up a run
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PipelineError::CollectionNotFound { .. }
                | PipelineError::MissingNodeCollection { .. }
                | PipelineError::UnknownStrategy(_)
                | PipelineError::Config(_)
        )
    }
}

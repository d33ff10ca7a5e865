//! Error types for rusty-pipeline

use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for pipeline construction and evaluation
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Dependency cycle detected at term {term}")]
    CyclicGraph { term: String },

    #[error("Type mismatch in term {term}: expected {expected}, found {found}")]
    TypeMismatch {
        term: String,
        expected: String,
        found: String,
    },

    #[error("Invalid window length {window_length} for term {term} (minimum {minimum})")]
    InvalidWindowLength {
        term: String,
        window_length: usize,
        minimum: usize,
    },

    #[error("Invalid term {term}: {reason}")]
    InvalidTerm { term: String, reason: String },

    #[error(
        "Insufficient history before {start}: {required} prior trading dates required, {available} available"
    )]
    InsufficientHistory {
        start: NaiveDate,
        required: usize,
        available: usize,
    },

    #[error("Timed out fetching column {column} for {date} after {attempts} attempt(s)")]
    DataFetchTimeout {
        column: String,
        date: NaiveDate,
        attempts: u32,
    },

    #[error("Duplicate output column: {0}")]
    DuplicateColumn(String),

    #[error("Unknown dataset column: {0}")]
    UnknownColumn(String),

    #[error("Unknown term reference: {0}")]
    UnknownTerm(String),

    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Pipeline definition error: {0}")]
    Definition(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("DataFrame error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl PipelineError {
    /// Whether this error is raised while building the graph or schedule,
    /// before any date is evaluated.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PipelineError::CyclicGraph { .. }
                | PipelineError::TypeMismatch { .. }
                | PipelineError::InvalidWindowLength { .. }
                | PipelineError::InvalidTerm { .. }
                | PipelineError::InsufficientHistory { .. }
                | PipelineError::DuplicateColumn(_)
                | PipelineError::UnknownColumn(_)
                | PipelineError::UnknownTerm(_)
                | PipelineError::InvalidDateRange { .. }
                | PipelineError::Definition(_)
        )
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

//! Error types for every layer of the sync pipeline
//!
//! Library code returns these typed errors; the binaries wrap them with
//! anyhow context and the HTTP layer maps them to status codes.

use std::fmt;
use thiserror::Error;

/// Failures of the amount/date normalizer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("invalid format: {raw:?} does not match {layout:?}")]
    InvalidFormat { raw: String, layout: String },

    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),
}

/// Which half of an insert/delete apply a partial failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    Insert,
    Delete,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStep::Insert => write!(f, "insert"),
            ApplyStep::Delete => write!(f, "delete"),
        }
    }
}

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database handle is poisoned")]
    Poisoned,

    /// One half of a non-atomic apply committed and the other did not
    #[error("partial sync: {completed} of {count} rows committed but {failed} failed: {source}")]
    PartialSync {
        completed: ApplyStep,
        count: usize,
        failed: ApplyStep,
        #[source]
        source: rusqlite::Error,
    },
}

/// Failures talking to the spreadsheet or PDF extraction services
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("credential error: {0}")]
    Credentials(#[from] jsonwebtoken::errors::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid source url: {0}")]
    Url(String),
}

/// Statement payload could not be read as a JSON object
#[derive(Error, Debug)]
pub enum StatementError {
    #[error("error parsing statement JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("statement payload is not a JSON object")]
    NotAnObject,
}

/// Failures of a whole sync run
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error("no data found on spreadsheet range {0}")]
    EmptySheet(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("error reading directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration problems found at startup
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

//! Error taxonomy for the exporter.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sample::Sample;

/// Outcome of one collection cycle.
pub type CollectorResult = Result<Vec<Sample>, CollectionError>;

/// Fatal configuration errors, raised at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid listen address {0:?}: expected host:port")]
    ListenAddress(String),

    #[error("invalid {field} pattern: {source}")]
    Pattern {
        field: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("invalid value for environment variable {key}: {value:?}")]
    Env { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-cycle, recoverable collection failures.
///
/// These never leave the scheduler: they are counted, logged, and the last
/// good samples stay in the registry.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    #[error("collector panicked: {0}")]
    Panicked(String),

    #[error("duplicate sample {name}{labels}")]
    DuplicateSample { name: String, labels: String },
}

impl CollectionError {
    /// Short machine-readable class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectionError::ServiceUnavailable { .. } => "service_unavailable",
            CollectionError::FileNotFound(_) => "file_not_found",
            CollectionError::Io { .. } => "io",
            CollectionError::QueryTimeout(_) => "query_timeout",
            CollectionError::ConnectionLost(_) => "connection_lost",
            CollectionError::Query(_) => "query",
            CollectionError::Parse(_) => "parse",
            CollectionError::Timeout(_) => "timeout",
            CollectionError::Panicked(_) => "panic",
            CollectionError::DuplicateSample { .. } => "duplicate_sample",
        }
    }

    pub fn duplicate(sample: &Sample) -> Self {
        CollectionError::DuplicateSample {
            name: sample.name().to_string(),
            labels: format!("{:?}", sample.labels()),
        }
    }
}

//! otrs-core — shared building blocks for the OTRS exporter.
//!
//! - [`Sample`]: one named, labeled, timestamped measurement
//! - [`ExporterConfig`]: TOML file + `OTRS_EXP_*` environment overrides
//! - [`CollectionError`] / [`ConfigError`]: the error taxonomy shared by
//!   collectors, the scheduler, and the daemon

pub mod config;
pub mod error;
pub mod sample;

pub use config::{
    parse_duration, CollectorIntervals, DatabaseConfig, ExporterConfig, MailLogConfig,
    ServiceConfig,
};
pub use error::{CollectionError, CollectorResult, ConfigError};
pub use sample::{find_duplicate, Labels, MetricKind, Sample};

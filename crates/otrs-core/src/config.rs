//! Exporter configuration.
//!
//! Loaded from an optional TOML file, then overridden by `OTRS_EXP_*`
//! environment variables, then validated. Any failure here is fatal at
//! startup.
//!
//! ```toml
//! listen_address = "0.0.0.0:9875"
//! degraded_threshold = 3
//!
//! [[services]]
//! name = "web"
//! unit = "apache2.service"
//!
//! [mail_log]
//! path = "/opt/otrs/var/log/Daemon/SchedulerTaskWorkerERR.log"
//!
//! [collector_intervals]
//! service = "15s"
//! maillog = "30s"
//! ticketstats = "1m"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9875";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const HEALTH_PATH: &str = "/healthz";
pub const DEFAULT_MAIL_LOG_PATH: &str = "/opt/otrs/var/log/Daemon/SchedulerTaskWorkerERR.log";
pub const DEFAULT_FAILURE_PATTERN: &str =
    "Got no email|S/MIME|Could not re-process email|PostMaster";
pub const DEFAULT_SUCCESS_PATTERN: &str =
    r"(?i)(\d+ messages? fetched|fetched \d+ e?-?mails?)";

/// Minimum allowed collection interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for intervals, timeouts, and staleness.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Top-level exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    /// `host:port` the scrape endpoint binds to.
    pub listen_address: String,
    /// Path of the scrape endpoint.
    pub metrics_path: String,
    /// Lower the default log filter to `debug`.
    pub debug: bool,
    /// Consecutive failures before a collector is marked degraded.
    pub degraded_threshold: u32,
    /// A collector whose last success is older than this is reported stale.
    #[serde(deserialize_with = "de_duration")]
    pub stale_after: Duration,
    /// Time in-flight collections get to finish at shutdown.
    #[serde(deserialize_with = "de_duration")]
    pub shutdown_grace: Duration,
    /// Append the collection instant (ms) to every sample line.
    pub render_timestamps: bool,
    /// Per-call timeout for service manager queries and self-checks.
    #[serde(deserialize_with = "de_duration")]
    pub service_timeout: Duration,
    pub services: Vec<ServiceConfig>,
    pub mail_log: MailLogConfig,
    pub database: DatabaseConfig,
    pub collector_intervals: CollectorIntervals,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            debug: false,
            degraded_threshold: 3,
            stale_after: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            render_timestamps: false,
            service_timeout: Duration::from_secs(2),
            services: vec![
                ServiceConfig {
                    name: "web".to_string(),
                    unit: Some("apache2.service".to_string()),
                    self_check: None,
                },
                ServiceConfig {
                    name: "daemon".to_string(),
                    unit: Some("otrs-daemon.service".to_string()),
                    self_check: Some(vec![
                        "/opt/otrs/bin/otrs.Daemon.pl".to_string(),
                        "status".to_string(),
                    ]),
                },
            ],
            mail_log: MailLogConfig::default(),
            database: DatabaseConfig::default(),
            collector_intervals: CollectorIntervals::default(),
        }
    }
}

/// One service watched through the service manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Logical name used as the `service` label.
    pub name: String,
    /// Unit name; defaults to `{name}.service`.
    pub unit: Option<String>,
    /// Optional liveness command, run only while the unit is active.
    pub self_check: Option<Vec<String>>,
}

impl ServiceConfig {
    pub fn unit_name(&self) -> String {
        match &self.unit {
            Some(unit) => unit.clone(),
            None => format!("{}.service", self.name),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailLogConfig {
    pub path: PathBuf,
    pub success_pattern: String,
    pub failure_pattern: String,
    /// Count lines already in the file on the first cycle instead of
    /// starting at end-of-file.
    pub from_start: bool,
    /// Upper bound on bytes consumed per cycle.
    pub max_read_bytes: u64,
}

impl Default for MailLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_MAIL_LOG_PATH),
            success_pattern: DEFAULT_SUCCESS_PATTERN.to_string(),
            failure_pattern: DEFAULT_FAILURE_PATTERN.to_string(),
            from_start: false,
            max_read_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Full `mysql://` DSN; takes precedence over the component fields.
    pub dsn: Option<String>,
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub query_timeout_seconds: u64,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            host: "127.0.0.1".to_string(),
            name: "otrs".to_string(),
            user: "otrs".to_string(),
            password: None,
            query_timeout_seconds: 5,
            max_connections: 2,
        }
    }
}

impl DatabaseConfig {
    /// Without a DSN or a password there is nothing to connect with and the
    /// ticket statistics collector stays off.
    pub fn is_configured(&self) -> bool {
        self.dsn.is_some() || self.password.is_some()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorIntervals {
    #[serde(deserialize_with = "de_duration")]
    pub service: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub maillog: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub ticketstats: Duration,
}

impl Default for CollectorIntervals {
    fn default() -> Self {
        Self {
            service: Duration::from_secs(15),
            maillog: Duration::from_secs(30),
            ticketstats: Duration::from_secs(60),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `OTRS_EXP_*` overrides. `lookup` abstracts the environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ip = lookup("OTRS_EXP_IP");
        let port = lookup("OTRS_EXP_PORT");
        if ip.is_some() || port.is_some() {
            let (current_host, current_port) = self
                .listen_address
                .rsplit_once(':')
                .unwrap_or(("0.0.0.0", "9875"));
            let host = ip.unwrap_or_else(|| current_host.to_string());
            let port = match port {
                Some(p) => {
                    p.trim().parse::<u16>().map_err(|_| ConfigError::Env {
                        key: "OTRS_EXP_PORT",
                        value: p.clone(),
                    })?;
                    p.trim().to_string()
                }
                None => current_port.to_string(),
            };
            self.listen_address = format!("{host}:{port}");
        }

        if let Some(v) = lookup("OTRS_EXP_DEBUG") {
            self.debug = parse_flag(&v).ok_or(ConfigError::Env {
                key: "OTRS_EXP_DEBUG",
                value: v,
            })?;
        }
        if let Some(v) = lookup("OTRS_EXP_LOG_PATH") {
            self.mail_log.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("OTRS_EXP_DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = lookup("OTRS_EXP_DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = lookup("OTRS_EXP_DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = lookup("OTRS_EXP_DB_PW") {
            self.database.password = Some(v);
        }
        if let Some(v) = lookup("OTRS_EXP_DB_DSN") {
            self.database.dsn = Some(v);
        }
        if let Some(v) = lookup("OTRS_EXP_QUERY_TIMEOUT") {
            self.database.query_timeout_seconds =
                v.trim().parse().map_err(|_| ConfigError::Env {
                    key: "OTRS_EXP_QUERY_TIMEOUT",
                    value: v.clone(),
                })?;
        }
        if let Some(v) = lookup("OTRS_EXP_DEGRADED_THRESHOLD") {
            self.degraded_threshold = v.trim().parse().map_err(|_| ConfigError::Env {
                key: "OTRS_EXP_DEGRADED_THRESHOLD",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    /// Check everything that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_listen_address(&self.listen_address)?;

        if !self.metrics_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "metrics_path must start with '/': {:?}",
                self.metrics_path
            )));
        }
        if self.metrics_path == HEALTH_PATH {
            return Err(ConfigError::Invalid(format!(
                "metrics_path must not be {HEALTH_PATH}"
            )));
        }
        if self.degraded_threshold == 0 {
            return Err(ConfigError::Invalid(
                "degraded_threshold must be at least 1".to_string(),
            ));
        }

        let intervals = [
            ("service", self.collector_intervals.service),
            ("maillog", self.collector_intervals.maillog),
            ("ticketstats", self.collector_intervals.ticketstats),
        ];
        for (name, interval) in intervals {
            if interval < MIN_INTERVAL {
                return Err(ConfigError::Invalid(format!(
                    "collector_intervals.{name} must be at least {MIN_INTERVAL:?}"
                )));
            }
        }
        let bounded = [
            ("collector_intervals.service", self.collector_intervals.service),
            ("collector_intervals.maillog", self.collector_intervals.maillog),
            ("collector_intervals.ticketstats", self.collector_intervals.ticketstats),
            ("stale_after", self.stale_after),
            ("shutdown_grace", self.shutdown_grace),
            ("service_timeout", self.service_timeout),
            ("database.query_timeout_seconds", self.database.query_timeout()),
        ];
        for (name, value) in bounded {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not exceed {MAX_DURATION:?}"
                )));
            }
        }
        if self.service_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "service_timeout must be positive".to_string(),
            ));
        }
        if self.database.query_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "database.query_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.mail_log.max_read_bytes == 0 {
            return Err(ConfigError::Invalid(
                "mail_log.max_read_bytes must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::Invalid("service name must not be empty".to_string()));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name {:?}",
                    service.name
                )));
            }
            if let Some(cmd) = &service.self_check {
                if cmd.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "self_check for service {:?} is empty",
                        service.name
                    )));
                }
            }
        }

        Regex::new(&self.mail_log.success_pattern).map_err(|source| ConfigError::Pattern {
            field: "success",
            source,
        })?;
        Regex::new(&self.mail_log.failure_pattern).map_err(|source| ConfigError::Pattern {
            field: "failure",
            source,
        })?;

        Ok(())
    }
}

fn validate_listen_address(addr: &str) -> Result<(), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::ListenAddress(addr.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ConfigError::ListenAddress(addr.to_string()));
    }
    Ok(())
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration like `"500ms"`, `"15s"`, `"2m"`, or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
}

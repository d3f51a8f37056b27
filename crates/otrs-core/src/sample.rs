//! The measurement model shared by collectors, the registry, and the renderer.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::SystemTime;

/// Label set of a sample. Keys are unique; ordering is irrelevant to
/// identity but a `BTreeMap` keeps rendering deterministic.
pub type Labels = BTreeMap<String, String>;

/// Metric type as announced in the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single measurement.
///
/// Samples are built with [`Sample::gauge`] / [`Sample::counter`] plus the
/// consuming `with_*` methods and are never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    name: String,
    labels: Labels,
    value: f64,
    kind: MetricKind,
    timestamp: SystemTime,
}

impl Sample {
    /// Create a gauge sample stamped with the current time.
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Gauge)
    }

    /// Create a counter sample stamped with the current time.
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Counter)
    }

    fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            value,
            kind,
            timestamp: SystemTime::now(),
        }
    }

    /// Add (or replace) a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Override the collection instant.
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Return the first sample whose `name` + `labels` pair already appeared
/// earlier in `samples`.
pub fn find_duplicate(samples: &[Sample]) -> Option<&Sample> {
    let mut seen: HashSet<(&str, &Labels)> = HashSet::with_capacity(samples.len());
    samples
        .iter()
        .find(|s| !seen.insert((s.name(), s.labels())))
}

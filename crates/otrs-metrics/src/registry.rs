//! Registry — latest collection result per collector.
//!
//! Read-heavy: the scheduler publishes once per cycle per collector, scrape
//! handlers snapshot on every request. Each entry is an immutable
//! `Arc<RegistryEntry>`; publishing builds a new entry and swaps it in, and
//! a snapshot clones the map of `Arc`s under a short read lock. Rendering
//! happens outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::debug;

use otrs_core::{CollectorResult, Sample};

/// Failure bookkeeping for one collector, maintained by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorHealth {
    /// Failed cycles since startup.
    pub errors_total: u64,
    /// Failed cycles since the last success.
    pub consecutive_failures: u32,
    /// Set after `degraded_threshold` consecutive failures.
    pub degraded: bool,
}

/// Per-cycle metadata accompanying a publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    /// Wall time of the collection attempt.
    pub duration: Duration,
    pub health: CollectorHealth,
}

/// The latest state of one collector.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Samples from the last successful cycle, kept across failures.
    samples: Option<Arc<[Sample]>>,
    /// Message of the latest failure, cleared on success.
    last_error: Option<String>,
    last_success_at: Option<SystemTime>,
    last_attempt_at: SystemTime,
    stats: CycleStats,
}

impl RegistryEntry {
    /// Samples of the last successful cycle (empty if none succeeded yet).
    pub fn samples(&self) -> &[Sample] {
        self.samples.as_deref().unwrap_or(&[])
    }

    pub fn has_succeeded(&self) -> bool {
        self.last_success_at.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_success_at(&self) -> Option<SystemTime> {
        self.last_success_at
    }

    pub fn last_attempt_at(&self) -> SystemTime {
        self.last_attempt_at
    }

    pub fn health(&self) -> CollectorHealth {
        self.stats.health
    }

    pub fn last_duration(&self) -> Duration {
        self.stats.duration
    }
}

/// Process-wide store of the latest result per collector name.
///
/// Passed explicitly (`Arc<Registry>`) to the scheduler and the HTTP layer.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    /// Age after which a collector's last success counts as stale.
    stale_after: Duration,
}

impl Registry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    /// Record the outcome of one cycle for `name`.
    ///
    /// On success the sample set is replaced; on failure the previous
    /// samples are carried into the new entry unchanged.
    pub async fn publish(
        &self,
        name: &str,
        result: CollectorResult,
        at: SystemTime,
        stats: CycleStats,
    ) {
        let mut entries = self.entries.write().await;
        let previous = entries.get(name);

        let entry = match result {
            Ok(samples) => RegistryEntry {
                samples: Some(samples.into()),
                last_error: None,
                last_success_at: Some(at),
                last_attempt_at: at,
                stats,
            },
            Err(e) => RegistryEntry {
                samples: previous.and_then(|p| p.samples.clone()),
                last_error: Some(e.to_string()),
                last_success_at: previous.and_then(|p| p.last_success_at),
                last_attempt_at: at,
                stats,
            },
        };

        debug!(
            collector = %name,
            samples = entry.samples().len(),
            ok = entry.last_error.is_none(),
            "registry entry published"
        );
        entries.insert(name.to_string(), Arc::new(entry));
    }

    /// Take an immutable copy of every current entry.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let entries = self.entries.read().await;
        RegistrySnapshot {
            taken_at: SystemTime::now(),
            stale_after: self.stale_after,
            entries: entries
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect(),
        }
    }
}

/// Point-in-time view of the registry, safe to iterate while publishes
/// continue.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    taken_at: SystemTime,
    stale_after: Duration,
    entries: BTreeMap<String, Arc<RegistryEntry>>,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name).map(|e| e.as_ref())
    }

    /// Entries sorted by collector name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e.as_ref()))
    }

    /// A collector is stale if it never succeeded or its last success is
    /// older than the registry's `stale_after`.
    pub fn is_stale(&self, entry: &RegistryEntry) -> bool {
        match entry.last_success_at {
            None => true,
            Some(at) => self
                .taken_at
                .duration_since(at)
                .map(|age| age > self.stale_after)
                .unwrap_or(false),
        }
    }

    /// Collector-produced samples, grouped by collector name order.
    pub fn collector_samples(&self) -> impl Iterator<Item = &Sample> {
        self.entries.values().flat_map(|e| e.samples().iter())
    }

    /// Exporter bookkeeping samples for every collector present.
    pub fn meta_samples(&self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.entries.len() * 5);
        for (name, entry) in &self.entries {
            let health = entry.health();
            out.push(
                Sample::counter("exporter_collector_errors_total", health.errors_total as f64)
                    .with_label("collector", name.as_str())
                    .at(entry.last_attempt_at),
            );
            out.push(
                Sample::gauge("exporter_collector_degraded", bool_value(health.degraded))
                    .with_label("collector", name.as_str())
                    .at(entry.last_attempt_at),
            );
            out.push(
                Sample::gauge("exporter_collector_stale", bool_value(self.is_stale(entry)))
                    .with_label("collector", name.as_str())
                    .at(self.taken_at),
            );
            out.push(
                Sample::gauge(
                    "exporter_collector_duration_seconds",
                    entry.last_duration().as_secs_f64(),
                )
                .with_label("collector", name.as_str())
                .at(entry.last_attempt_at),
            );
            if let Some(at) = entry.last_success_at {
                out.push(
                    Sample::gauge(
                        "exporter_collector_last_success_timestamp_seconds",
                        epoch_secs_f64(at),
                    )
                    .with_label("collector", name.as_str())
                    .at(at),
                );
            }
        }
        out
    }
}

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

pub(crate) fn epoch_secs_f64(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

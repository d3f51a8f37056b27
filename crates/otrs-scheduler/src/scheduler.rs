//! Scheduler — one background task per collector.
//!
//! Each task sleeps a jittered interval, runs one cycle under the
//! collector's timeout and a panic guard, updates its [`FailureTracker`],
//! and publishes the outcome. Cycles of one collector never overlap; a
//! cycle that runs long simply delays the next one.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use otrs_collectors::Collector;
use otrs_core::{find_duplicate, CollectionError, CollectorResult};
use otrs_metrics::{CycleStats, Registry};

use crate::error::{SchedulerError, SchedulerResult};
use crate::tracker::{CycleOutcome, FailureTracker};

struct CollectorTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns the collector loops and their shared shutdown signal.
pub struct Scheduler {
    registry: Arc<Registry>,
    degraded_threshold: u32,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<CollectorTask>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, degraded_threshold: u32) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            degraded_threshold,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Start a background loop for `collector`.
    ///
    /// The first cycle runs after a random delay of up to a tenth of the
    /// interval so collectors started together do not fire in lockstep.
    pub fn schedule<C: Collector>(&mut self, collector: C, interval: Duration) -> SchedulerResult<()> {
        let name = collector.name().to_string();
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(SchedulerError::AlreadyScheduled(name));
        }

        let registry = Arc::clone(&self.registry);
        let tracker = FailureTracker::new(name.clone(), self.degraded_threshold);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            run_collector_loop(collector, interval, tracker, registry, shutdown_rx).await;
        });

        info!(collector = %name, ?interval, "collector scheduled");
        self.tasks.push(CollectorTask { name, handle });
        Ok(())
    }

    /// Names of scheduled collectors, in scheduling order.
    pub fn collectors(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Signal every loop to stop and wait up to `grace` for in-flight cycles.
    ///
    /// Loops still running at the deadline are aborted and reported in
    /// [`SchedulerError::GraceExceeded`].
    pub async fn stop(self, grace: Duration) -> SchedulerResult<()> {
        let _ = self.shutdown_tx.send(true);
        let deadline = instant_after(Instant::now(), grace);
        let mut aborted = Vec::new();

        for mut task in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(_) => debug!(collector = %task.name, "collector loop stopped"),
                Err(_) => {
                    task.handle.abort();
                    warn!(collector = %task.name, "collector loop aborted after grace period");
                    aborted.push(task.name);
                }
            }
        }

        if aborted.is_empty() {
            info!("all collector loops stopped");
            Ok(())
        } else {
            Err(SchedulerError::GraceExceeded(aborted))
        }
    }
}

/// The loop for a single collector.
async fn run_collector_loop<C: Collector>(
    mut collector: C,
    interval: Duration,
    mut tracker: FailureTracker,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = instant_after(Instant::now(), initial_delay(interval));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!(collector = %collector.name(), "collector loop shutting down");
                break;
            }
            _ = tokio::time::sleep_until(next) => {
                let started = Instant::now();
                run_cycle(&mut collector, &mut tracker, &registry).await;
                next = instant_after(started, jittered(interval));
            }
        }
    }
}

/// Run one guarded cycle and publish its outcome.
async fn run_cycle<C: Collector>(collector: &mut C, tracker: &mut FailureTracker, registry: &Registry) {
    let name = collector.name().to_string();
    let timeout = collector.timeout();
    let started = Instant::now();

    let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, collector.collect()))
        .catch_unwind()
        .await;
    let duration = started.elapsed();

    let result: CollectorResult = match outcome {
        Ok(Ok(result)) => result.and_then(reject_duplicates),
        Ok(Err(_elapsed)) => Err(CollectionError::Timeout(timeout)),
        Err(panic) => Err(CollectionError::Panicked(panic_message(panic.as_ref()))),
    };

    let health = match &result {
        Ok(samples) => {
            debug!(collector = %name, samples = samples.len(), ?duration, "collection cycle succeeded");
            tracker.record(CycleOutcome::Succeeded)
        }
        Err(e) => {
            let health = tracker.record(CycleOutcome::Failed);
            warn!(
                collector = %name,
                kind = e.kind(),
                error = %e,
                consecutive_failures = health.consecutive_failures,
                "collection cycle failed"
            );
            health
        }
    };

    registry
        .publish(&name, result, SystemTime::now(), CycleStats { duration, health })
        .await;
}

fn reject_duplicates(samples: Vec<otrs_core::Sample>) -> CollectorResult {
    match find_duplicate(&samples) {
        Some(dup) => Err(CollectionError::duplicate(dup)),
        None => Ok(samples),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn initial_delay(interval: Duration) -> Duration {
    scale(interval, rand::rng().random_range(0.0..0.1))
}

/// `interval` ± 10%.
fn jittered(interval: Duration) -> Duration {
    scale(interval, rand::rng().random_range(0.9..1.1))
}

/// `interval * factor`, or `interval` itself when the product does not fit.
fn scale(interval: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(interval.as_secs_f64() * factor).unwrap_or(interval)
}

/// `start + d`, clamped to roughly thirty years out.
fn instant_after(start: Instant, d: Duration) -> Instant {
    start
        .checked_add(d)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365 * 30))
}

//! Consecutive-failure tracking per collector.

use tracing::{info, warn};

use otrs_metrics::CollectorHealth;

/// Outcome of one collection cycle, as far as health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded,
    Failed,
}

/// Tracks consecutive failures for a single collector.
///
/// The collector turns degraded once `threshold` cycles in a row fail and
/// recovers on the next success.
#[derive(Debug)]
pub struct FailureTracker {
    collector: String,
    threshold: u32,
    health: CollectorHealth,
}

impl FailureTracker {
    pub fn new(collector: impl Into<String>, threshold: u32) -> Self {
        Self {
            collector: collector.into(),
            threshold: threshold.max(1),
            health: CollectorHealth::default(),
        }
    }

    /// Record a cycle outcome and return the updated health.
    pub fn record(&mut self, outcome: CycleOutcome) -> CollectorHealth {
        match outcome {
            CycleOutcome::Succeeded => {
                if self.health.degraded {
                    info!(
                        collector = %self.collector,
                        failures = self.health.consecutive_failures,
                        "collector recovered"
                    );
                }
                self.health.consecutive_failures = 0;
                self.health.degraded = false;
            }
            CycleOutcome::Failed => {
                self.health.errors_total += 1;
                self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);

                if self.health.consecutive_failures >= self.threshold && !self.health.degraded {
                    warn!(
                        collector = %self.collector,
                        failures = self.health.consecutive_failures,
                        threshold = self.threshold,
                        "collector marked degraded"
                    );
                    self.health.degraded = true;
                }
            }
        }

        self.health
    }

    pub fn health(&self) -> CollectorHealth {
        self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_clean() {
        let tracker = FailureTracker::new("maillog", 3);
        assert_eq!(tracker.health(), CollectorHealth::default());
    }

    #[test]
    fn stays_healthy_under_threshold() {
        let mut tracker = FailureTracker::new("maillog", 3);
        tracker.record(CycleOutcome::Failed);
        let health = tracker.record(CycleOutcome::Failed);
        assert!(!health.degraded);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.errors_total, 2);
    }

    #[test]
    fn degraded_at_threshold_and_recovers_on_success() {
        let mut tracker = FailureTracker::new("ticketstats", 3);
        for _ in 0..3 {
            tracker.record(CycleOutcome::Failed);
        }
        assert!(tracker.health().degraded);

        let health = tracker.record(CycleOutcome::Failed);
        assert!(health.degraded);
        assert_eq!(health.consecutive_failures, 4);

        let health = tracker.record(CycleOutcome::Succeeded);
        assert!(!health.degraded);
        assert_eq!(health.consecutive_failures, 0);
        // The error counter is monotonic.
        assert_eq!(health.errors_total, 4);
    }

    #[test]
    fn success_resets_streak() {
        let mut tracker = FailureTracker::new("service", 2);
        tracker.record(CycleOutcome::Failed);
        tracker.record(CycleOutcome::Succeeded);
        let health = tracker.record(CycleOutcome::Failed);
        assert!(!health.degraded);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let mut tracker = FailureTracker::new("service", 0);
        assert!(tracker.record(CycleOutcome::Failed).degraded);
    }
}

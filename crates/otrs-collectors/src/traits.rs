//! The collector capability and the closed set of implementations.

use std::future::Future;
use std::time::Duration;

use otrs_core::CollectorResult;

use crate::maillog::MailLogCollector;
use crate::service::{ServiceHealthCollector, Systemctl};
use crate::tickets::{MySqlTicketStore, TicketStatsCollector};

/// A producer of samples from one signal source.
///
/// A collector is owned by exactly one scheduler task, so `collect` takes
/// `&mut self` and may keep state (cursors, accumulators) between cycles.
pub trait Collector: Send + 'static {
    /// Unique name, used as the registry key and the `collector` label.
    fn name(&self) -> &str;

    /// Upper bound for one `collect` call; the scheduler cancels the cycle
    /// and records a failure after this.
    fn timeout(&self) -> Duration;

    /// Run one collection cycle.
    fn collect(&mut self) -> impl Future<Output = CollectorResult> + Send;
}

/// Every collector the exporter knows about.
pub enum AnyCollector {
    Service(ServiceHealthCollector<Systemctl>),
    MailLog(MailLogCollector),
    TicketStats(TicketStatsCollector<MySqlTicketStore>),
}

impl Collector for AnyCollector {
    fn name(&self) -> &str {
        match self {
            AnyCollector::Service(c) => c.name(),
            AnyCollector::MailLog(c) => c.name(),
            AnyCollector::TicketStats(c) => c.name(),
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            AnyCollector::Service(c) => c.timeout(),
            AnyCollector::MailLog(c) => c.timeout(),
            AnyCollector::TicketStats(c) => c.timeout(),
        }
    }

    async fn collect(&mut self) -> CollectorResult {
        match self {
            AnyCollector::Service(c) => c.collect().await,
            AnyCollector::MailLog(c) => c.collect().await,
            AnyCollector::TicketStats(c) => c.collect().await,
        }
    }
}

//! Collector assembly from configuration.

use std::time::Duration;

use tracing::{info, warn};

use otrs_core::{ConfigError, ExporterConfig};

use crate::maillog::MailLogCollector;
use crate::service::{ServiceHealthCollector, Systemctl};
use crate::tickets::{MySqlTicketStore, TicketStatsCollector};
use crate::traits::AnyCollector;

/// Mail log reads are local file I/O; this is generous.
const MAIL_LOG_TIMEOUT: Duration = Duration::from_secs(10);

/// A collector paired with its collection interval.
pub struct ScheduledCollector {
    pub collector: AnyCollector,
    pub interval: Duration,
}

/// Build every collector the configuration enables.
///
/// The ticket statistics collector needs database credentials; without them
/// it is left out and the exporter runs with the other two.
pub fn configured_collectors(config: &ExporterConfig) -> Result<Vec<ScheduledCollector>, ConfigError> {
    let intervals = &config.collector_intervals;
    let mut collectors = Vec::with_capacity(3);

    if config.services.is_empty() {
        warn!("no services configured, service health collector disabled");
    } else {
        collectors.push(ScheduledCollector {
            collector: AnyCollector::Service(ServiceHealthCollector::new(
                Systemctl,
                config.services.clone(),
                config.service_timeout,
            )),
            interval: intervals.service,
        });
    }

    collectors.push(ScheduledCollector {
        collector: AnyCollector::MailLog(MailLogCollector::new(&config.mail_log, MAIL_LOG_TIMEOUT)?),
        interval: intervals.maillog,
    });

    if config.database.is_configured() {
        let store = MySqlTicketStore::connect_lazy(&config.database)?;
        collectors.push(ScheduledCollector {
            collector: AnyCollector::TicketStats(TicketStatsCollector::new(
                store,
                intervals.ticketstats,
                config.database.query_timeout(),
            )),
            interval: intervals.ticketstats,
        });
    } else {
        warn!("no database credentials configured, ticket statistics disabled");
    }

    info!(count = collectors.len(), "collectors configured");
    Ok(collectors)
}

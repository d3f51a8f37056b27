//! otrs-collectors — the three signal sources of the exporter.
//!
//! # Architecture
//!
//! ```text
//! Collector (collect() → Vec<Sample> | CollectionError)
//!   ├── ServiceHealthCollector  ── ServiceManager (systemctl)
//!   ├── MailLogCollector        ── LogCursor (offset + file identity)
//!   └── TicketStatsCollector    ── TicketStore (MySQL via sqlx)
//! ```
//!
//! [`AnyCollector`] is the closed set of collectors chosen at startup from
//! configuration; [`configured_collectors`] builds it.

pub mod maillog;
pub mod service;
pub mod setup;
pub mod tickets;
pub mod traits;

pub use maillog::{FileIdentity, LogCursor, MailLogCollector};
pub use service::{ActiveState, ServiceHealth, ServiceHealthCollector, ServiceManager, Systemctl, UnitStatus};
pub use setup::{configured_collectors, ScheduledCollector};
pub use tickets::{MySqlTicketStore, QueueStats, TicketStatsCollector, TicketStore};
pub use traits::{AnyCollector, Collector};

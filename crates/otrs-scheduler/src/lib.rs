//! otrs-scheduler — drives every collector on its own interval.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Per-collector background task
//!   │   ├── jittered sleep (interval ± 10%)
//!   │   ├── collect() under timeout + panic guard
//!   │   ├── FailureTracker (consecutive failures, degraded flag)
//!   │   └── Registry::publish(result, CycleStats)
//!   └── watch shutdown signal, grace period, then abort
//! ```
//!
//! A failing, hanging, or panicking collector only ever affects its own
//! registry entry.

pub mod error;
pub mod scheduler;
pub mod tracker;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
pub use tracker::{CycleOutcome, FailureTracker};

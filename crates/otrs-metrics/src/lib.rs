//! otrs-metrics — the latest-value store and its text exposition.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ── publish(name, result, at, stats) ──► Registry
//!                                                     │
//! scrape handler ◄── snapshot() ── RegistrySnapshot ◄─┘
//!        │
//!        └── render() → text/plain for /metrics
//! ```
//!
//! Entries are replaced whole (`Arc` swap), so a snapshot sees either the
//! previous or the latest publish for a collector, never a mix.

pub mod prometheus;
pub mod registry;

pub use prometheus::{render, RenderError, RenderOptions, Rendered, CONTENT_TYPE};
pub use registry::{CollectorHealth, CycleStats, Registry, RegistryEntry, RegistrySnapshot};

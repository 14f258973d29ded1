//! Asynchronous, loss-tolerant usage accounting.
//!
//! Records are queued without blocking, persisted by a single writer into an
//! embedded SQLite store, and replayed into the in-memory statistics view on
//! startup. Usage is an observability signal, not billing: on overload,
//! records are dropped and counted.

mod entities;
mod pipeline;
mod record;
mod stats;
mod store;

pub use pipeline::{DEFAULT_QUEUE_CAPACITY, UsagePipeline};
pub use record::{TokenCounts, UsageRecord};
pub use stats::{ModelStats, RequestStatistics, StatsSnapshot};
pub use store::{UsageAggregate, UsageStore, UsageStoreError};

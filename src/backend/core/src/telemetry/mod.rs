//! Telemetry for the batch scheduler.
//!
//! Logging goes through `tracing` with a `tracing-subscriber` formatter chosen
//! by [`LoggingConfig`]. Counters are recorded through the `metrics` facade;
//! no exporter is installed here, so they are free until a recorder exists.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};

/// Counter names recorded by this crate.
pub mod names {
    /// Every logged [`BatchError`](crate::error::BatchError), by code and category.
    pub const ERRORS_TOTAL: &str = "sqlbatch_errors_total";
    /// Per-job cycle outcomes, by `outcome`.
    pub const JOBS_TOTAL: &str = "sqlbatch_jobs_total";
}

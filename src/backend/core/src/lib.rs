#![allow(clippy::result_large_err)]
//! # SQLBatch Core
//!
//! Multi-tenant batch SQL job scheduling.
//!
//! ## Architecture
//!
//! - **Jobs**: job model, Redis-backed store and per-tenant queues
//! - **Discovery**: bounded SCAN over queue keys to find tenants with work
//! - **Scheduler**: one claimed job per tenant per cycle, executed against the tenant's database
//! - **Service**: job control for the request layer, including cooperative cancellation
//! - **Telemetry**: structured logging and error/outcome counters

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{BatchError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{BatchError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::jobs::{
        CancellationRegistry, ConnectionParams, CycleReport, ExecutionError, InMemoryStore, Job,
        JobId, JobQuery, JobService, JobStatus, JobStore, JobStoreConfig, JobView,
        KeyValueStore, NewJob, PgQueryExecutor, QueryExecutor, QueueSeeker, RedisStore,
        Scheduler, SchedulerConfig, SchedulerHandle, SeekerConfig, TenantQueue,
        WorkInProgressIndex,
    };
}

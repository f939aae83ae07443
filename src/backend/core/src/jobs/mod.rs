//! Batch SQL job system.
//!
//! - **Job**: the record, its query payload and the status state machine
//! - **Storage**: the key/value capability everything else is written against
//! - **Store**: durable job records, admission and the work-in-progress index
//! - **Queue**: per-tenant FIFO of pending job ids
//! - **Seeker**: bounded discovery of tenants with queued work
//! - **Executor**: runs a job's SQL against the tenant database
//! - **Scheduler**: the recurring discover / claim / execute cycle
//! - **Service**: create, get, cancel and list for the request layer
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  create   ┌────────────┐  admit   ┌──────────────────────┐
//! │ JobService │──────────▶│  JobStore  │─────────▶│ batch:jobs:<id>      │
//! └────────────┘           └────────────┘          │ batch:queue:<tenant> │
//!       │ cancel                                   └──────────────────────┘
//!       ▼                                                    ▲
//! ┌──────────────────────┐   seek / dequeue / claim          │
//! │ CancellationRegistry │◀──────────── Scheduler ───────────┘
//! └──────────────────────┘                 │ execute
//!                                          ▼
//!                                   QueryExecutor (Postgres)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use sqlbatch_core::jobs::*;
//!
//! let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(url).await?);
//! let jobs = JobStore::new(store.clone(), JobStoreConfig::default());
//! let seeker = QueueSeeker::new(store.clone(), SeekerConfig::default());
//! let wip = WorkInProgressIndex::new(store, seeker.clone());
//! let registry = CancellationRegistry::new();
//!
//! let service = JobService::new(jobs.clone(), wip.clone(), registry.clone(),
//!     JobServiceConfig::default());
//! let handle = Scheduler::new(jobs, seeker, wip, Arc::new(PgQueryExecutor::default()),
//!     registry, SchedulerConfig::default()).start();
//! ```

pub mod executor;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod seeker;
pub mod service;
pub mod storage;
pub mod store;

pub use executor::{ExecutionError, PgExecutorConfig, PgQueryExecutor, QueryExecutor};
pub use job::{ConnectionParams, Job, JobId, JobQuery, JobStatus, JobView};
pub use queue::{TenantQueue, QUEUE_PREFIX};
pub use scheduler::{
    CancellationRegistry, CycleReport, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats,
};
pub use seeker::{QueueSeeker, SeekerConfig};
pub use service::{JobService, JobServiceConfig, NewJob, DEFAULT_MAX_PAYLOAD_BYTES};
pub use storage::{Admission, InMemoryStore, KeyValueStore, RedisStore, ScanPage};
pub use store::{
    JobStore, JobStoreConfig, WorkInProgress, WorkInProgressIndex, JOB_PREFIX, WIP_PREFIX,
};

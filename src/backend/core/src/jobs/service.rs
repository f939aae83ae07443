//! Job control as seen by the request layer.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::job::{ConnectionParams, Job, JobId, JobQuery, JobStatus};
use super::scheduler::CancellationRegistry;
use super::store::{JobStore, WorkInProgress, WorkInProgressIndex};
use crate::error::{BatchError, ErrorCode, Result};

/// Default ceiling on the encoded query size.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// A job submission before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub user: String,
    pub query: JobQuery,
    #[serde(default)]
    pub connection: ConnectionParams,
}

/// Submission limits for [`JobService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobServiceConfig {
    /// Largest accepted encoded query, in bytes
    pub max_payload_bytes: usize,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Create, look up, cancel and list jobs.
#[derive(Clone)]
pub struct JobService {
    jobs: JobStore,
    wip: WorkInProgressIndex,
    registry: CancellationRegistry,
    config: JobServiceConfig,
}

impl JobService {
    pub fn new(
        jobs: JobStore,
        wip: WorkInProgressIndex,
        registry: CancellationRegistry,
        config: JobServiceConfig,
    ) -> Self {
        Self {
            jobs,
            wip,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &JobServiceConfig {
        &self.config
    }

    /// Validate and submit a job. Returns the stored pending record.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        if new.user.trim().is_empty() {
            return Err(BatchError::validation("A job needs an owning user"));
        }
        if new.query.is_empty() {
            return Err(BatchError::validation("You must indicate a valid SQL"));
        }
        let size = new.query.to_stored().len();
        let max = self.config.max_payload_bytes;
        if size > max {
            return Err(BatchError::new(
                ErrorCode::PayloadTooLarge,
                "Your payload is too large, max size is exceeded",
            )
            .with_tenant(new.user)
            .with_context("payload_bytes", size)
            .with_context("max_payload_bytes", max));
        }

        let job = Job::new(new.user, new.query, new.connection);
        self.jobs.create(&job).await
    }

    /// Look up a job by its text id. Ids that do not parse are unknown jobs.
    pub async fn get(&self, job_id: &str) -> Result<Job> {
        let id = parse_id(job_id)?;
        self.jobs.get(&id).await
    }

    /// Cancel a pending or running job and signal any in-flight execution.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let id = parse_id(job_id)?;
        let mut job = self.jobs.get(&id).await?;
        job.mark_cancelled()?;

        let cancellable = [JobStatus::Pending, JobStatus::Running];
        match self.jobs.save_if_status(&job, &cancellable).await? {
            Some(stored) => {
                // The scheduler may have claimed it between our read and write.
                let signalled = self.registry.cancel(&id);
                info!(job_id = %id, user = %stored.user, signalled, "Job cancelled");
                Ok(stored)
            }
            None => {
                let current = self.jobs.get(&id).await?;
                Err(
                    BatchError::invalid_transition(id.to_string(), current.status, JobStatus::Cancelled)
                        .with_tenant(current.user),
                )
            }
        }
    }

    /// Tenants with running jobs and the ids they are running.
    pub async fn list_work_in_progress(&self) -> Result<Vec<WorkInProgress>> {
        self.wip.list().await
    }
}

fn parse_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| BatchError::job_not_found(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::seeker::{QueueSeeker, SeekerConfig};
    use crate::jobs::storage::InMemoryStore;
    use crate::jobs::store::JobStoreConfig;
    use std::sync::Arc;

    fn service() -> (JobService, CancellationRegistry) {
        service_with(JobServiceConfig::default())
    }

    fn service_with(config: JobServiceConfig) -> (JobService, CancellationRegistry) {
        let store = Arc::new(InMemoryStore::new());
        let jobs = JobStore::new(store.clone(), JobStoreConfig::default());
        let wip = WorkInProgressIndex::new(store.clone(), QueueSeeker::new(store, SeekerConfig::default()));
        let registry = CancellationRegistry::new();
        (JobService::new(jobs, wip, registry.clone(), config), registry)
    }

    fn new_job(query: &str) -> NewJob {
        NewJob {
            user: "alice".into(),
            query: query.into(),
            connection: ConnectionParams::default(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (service, _) = service();
        let job = service.create(new_job("SELECT 1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let fetched = service.get(&job.job_id.to_string()).await.unwrap();
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn test_get_with_malformed_id_is_not_found() {
        let (service, _) = service();
        assert!(service.get("not-a-job").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_empty_query() {
        let (service, _) = service();
        let err = service.create(new_job("")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_rejects_oversize_payload() {
        let (service, _) = service_with(JobServiceConfig {
            max_payload_bytes: 16,
        });
        let err = service
            .create(new_job("SELECT * FROM a_rather_long_table_name"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PayloadTooLarge);
        assert_eq!(err.details().context["max_payload_bytes"], 16);

        // At the limit is still accepted.
        let job = service.create(new_job("SELECT 123456789")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_default_limit_is_16_kib() {
        let (service, _) = service();
        assert_eq!(service.config().max_payload_bytes, 16 * 1024);

        let err = service
            .create(new_job(&"x".repeat(16 * 1024 + 1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let (service, _) = service();
        let job = service.create(new_job("SELECT 1")).await.unwrap();
        let cancelled = service.cancel(&job.job_id.to_string()).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_signals_registered_token() {
        let (service, registry) = service();
        let job = service.create(new_job("SELECT 1")).await.unwrap();
        let token = registry.register(job.job_id);

        service.cancel(&job.job_id.to_string()).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_fails() {
        let (service, _) = service();
        let job = service.create(new_job("SELECT 1")).await.unwrap();
        service.cancel(&job.job_id.to_string()).await.unwrap();

        let err = service.cancel(&job.job_id.to_string()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(err.user_message(), "Cannot set status from cancelled to cancelled");
    }
}

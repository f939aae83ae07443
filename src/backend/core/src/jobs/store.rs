//! Durable job records.
//!
//! Each job lives in one hash at `batch:jobs:<job_id>`. A stored field only
//! counts when its value is non-empty, so optional fields are cleared by
//! writing an empty string. Terminal jobs get an expiry; nothing else does.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::job::{ConnectionParams, Job, JobId, JobQuery, JobStatus};
use super::queue::TenantQueue;
use super::seeker::QueueSeeker;
use super::storage::{Admission, KeyValueStore};
use crate::error::{BatchError, Result};

/// Key prefix for job records.
pub const JOB_PREFIX: &str = "batch:jobs:";

/// Key prefix for per-tenant sets of running job ids.
pub const WIP_PREFIX: &str = "batch:wip:user:";

/// Stored fields, mandatory ones first.
const FIELDS: [&str; 12] = [
    "user",
    "status",
    "query",
    "created_at",
    "updated_at",
    "host",
    "port",
    "dbname",
    "dbuser",
    "pass",
    "failed_reason",
    "fallback_status",
];

const MANDATORY_FIELDS: usize = 5;

/// Configuration for the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    /// Admission ceiling per tenant queue
    pub max_queued_jobs: usize,
    /// Expiry applied when a job reaches a terminal status
    pub finished_jobs_ttl_secs: u64,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            max_queued_jobs: 100,
            finished_jobs_ttl_secs: 2 * 3600,
        }
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn to_fields(job: &Job, updated_at: DateTime<Utc>) -> Vec<(&'static str, String)> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    vec![
        ("user", job.user.clone()),
        ("status", job.status.as_str().to_string()),
        ("query", job.query.to_stored()),
        ("created_at", format_timestamp(job.created_at)),
        ("updated_at", format_timestamp(updated_at)),
        ("host", opt(&job.connection.host)),
        ("port", job.connection.port.map(|p| p.to_string()).unwrap_or_default()),
        ("dbname", opt(&job.connection.dbname)),
        ("dbuser", opt(&job.connection.dbuser)),
        ("pass", opt(&job.connection.pass)),
        ("failed_reason", opt(&job.failed_reason)),
        ("fallback_status", opt(&job.fallback_status)),
    ]
}

fn from_fields(job_id: &JobId, values: Vec<Option<String>>) -> Result<Job> {
    let mut values: Vec<Option<String>> = values
        .into_iter()
        .map(|v| v.filter(|s| !s.is_empty()))
        .collect();
    values.resize(FIELDS.len(), None);

    if values[..MANDATORY_FIELDS].iter().any(Option::is_none) {
        return Err(BatchError::job_not_found(job_id.to_string()));
    }

    let mut take = |i: usize| values[i].take();
    let user = take(0).unwrap_or_default();
    let status = JobStatus::parse(&take(1).unwrap_or_default());
    let query = JobQuery::from_stored(&take(2).unwrap_or_default());
    let created_at = parse_timestamp(&take(3).unwrap_or_default());
    let updated_at = parse_timestamp(&take(4).unwrap_or_default());
    let connection = ConnectionParams {
        host: take(5),
        port: take(6).and_then(|p| p.parse().ok()),
        dbname: take(7),
        dbuser: take(8),
        pass: take(9),
    };
    let failed_reason = take(10);
    let fallback_status = take(11);

    let (created_at, updated_at) = match (created_at, updated_at) {
        (Ok(c), Ok(u)) => (c, u),
        (Err(e), _) | (_, Err(e)) => return Err(e.for_job(job_id, &user)),
    };

    Ok(Job {
        job_id: *job_id,
        user,
        query,
        status,
        created_at,
        updated_at,
        connection,
        failed_reason,
        fallback_status,
    })
}

/// Persistence and admission for job records.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn KeyValueStore>,
    queue: TenantQueue,
    config: JobStoreConfig,
}

impl JobStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: JobStoreConfig) -> Self {
        Self {
            queue: TenantQueue::new(store.clone()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    pub fn queue(&self) -> &TenantQueue {
        &self.queue
    }

    /// Store key for a job record.
    pub fn key(job_id: &JobId) -> String {
        format!("{}{}", JOB_PREFIX, job_id)
    }

    /// Load a job. Fails with `JobNotFound` if any mandatory field is absent.
    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        let values = self
            .store
            .hash_get(&Self::key(job_id), &FIELDS)
            .await
            .map_err(|e| e.with_job_id(job_id.to_string()))?;
        from_fields(job_id, values)
    }

    /// Admit, persist and enqueue a new job.
    pub async fn create(&self, job: &Job) -> Result<Job> {
        let tenant = job.user.as_str();
        let max = self.config.max_queued_jobs;

        let depth = self.queue.size(tenant).await.map_err(|e| {
            BatchError::store(
                "Failed to create job, could not determine user queue size",
                e.to_string(),
            )
            .for_job(job.job_id, tenant)
        })?;
        if depth >= max {
            return Err(BatchError::queue_full(tenant, max).with_job_id(job.job_id.to_string()));
        }

        match self.get(&job.job_id).await {
            Ok(_) => debug!(job_id = %job.job_id, user = tenant, "Overwriting existing job record"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.for_job(job.job_id, tenant)),
        }

        let fields = to_fields(job, Utc::now());
        let admission = self
            .store
            .admit(
                &TenantQueue::key(tenant),
                max,
                &Self::key(&job.job_id),
                &fields,
                &job.job_id.to_string(),
            )
            .await
            .map_err(|e| e.for_job(job.job_id, tenant))?;

        match admission {
            Admission::Admitted { depth } => {
                info!(job_id = %job.job_id, user = tenant, depth, "Job created");
            }
            Admission::Rejected { .. } => {
                return Err(BatchError::queue_full(tenant, max).with_job_id(job.job_id.to_string()));
            }
        }

        self.set_ttl(job).await?;
        self.get(&job.job_id).await
    }

    /// Overwrite an existing job. Terminal records are never rewritten.
    pub async fn update(&self, job: &Job) -> Result<Job> {
        let stored = self.get(&job.job_id).await?;
        if stored.status.is_terminal() {
            return Err(BatchError::invalid_transition(
                job.job_id.to_string(),
                stored.status,
                job.status,
            )
            .with_tenant(job.user.clone()));
        }
        self.save(job).await
    }

    /// Write every field, apply the TTL policy and return the stored record.
    pub async fn save(&self, job: &Job) -> Result<Job> {
        let fields = to_fields(job, Utc::now());
        self.store
            .hash_set(&Self::key(&job.job_id), &fields)
            .await
            .map_err(|e| e.for_job(job.job_id, &job.user))?;
        self.set_ttl(job).await?;
        self.get(&job.job_id).await
    }

    /// Like [`save`](Self::save), but only if the stored status is one of `expected`.
    ///
    /// Returns `None` without writing when the stored status has moved on.
    pub async fn save_if_status(&self, job: &Job, expected: &[JobStatus]) -> Result<Option<Job>> {
        let fields = to_fields(job, Utc::now());
        let expected: Vec<&str> = expected.iter().map(JobStatus::as_str).collect();
        let applied = self
            .store
            .hash_set_if(&Self::key(&job.job_id), "status", &expected, &fields)
            .await
            .map_err(|e| e.for_job(job.job_id, &job.user))?;
        if !applied {
            return Ok(None);
        }
        self.set_ttl(job).await?;
        self.get(&job.job_id).await.map(Some)
    }

    /// Arm the expiry if the job is terminal; otherwise do nothing.
    pub async fn set_ttl(&self, job: &Job) -> Result<()> {
        if !job.status.is_terminal() {
            return Ok(());
        }
        self.store
            .expire(&Self::key(&job.job_id), self.config.finished_jobs_ttl_secs)
            .await
            .map_err(|e| e.for_job(job.job_id, &job.user))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Work In Progress
// ═══════════════════════════════════════════════════════════════════════════════

/// Running jobs of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInProgress {
    pub user: String,
    pub jobs: Vec<String>,
}

/// Per-tenant sets of job ids currently executing.
#[derive(Clone)]
pub struct WorkInProgressIndex {
    store: Arc<dyn KeyValueStore>,
    seeker: QueueSeeker,
}

impl WorkInProgressIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, seeker: QueueSeeker) -> Self {
        Self { store, seeker }
    }

    pub fn key(tenant: &str) -> String {
        format!("{}{}", WIP_PREFIX, tenant)
    }

    pub async fn add(&self, tenant: &str, job_id: &JobId) -> Result<()> {
        self.store
            .set_add(&Self::key(tenant), &job_id.to_string())
            .await
            .map_err(|e| e.for_job(job_id, tenant))
    }

    pub async fn remove(&self, tenant: &str, job_id: &JobId) -> Result<()> {
        self.store
            .set_remove(&Self::key(tenant), &job_id.to_string())
            .await
            .map_err(|e| e.for_job(job_id, tenant))
    }

    /// Every tenant with running jobs, using the same bounded walk as discovery.
    pub async fn list(&self) -> Result<Vec<WorkInProgress>> {
        let pattern = format!("{}*", WIP_PREFIX);
        let mut out = Vec::new();
        for key in self.seeker.walk(&pattern).await {
            let Some(user) = key.strip_prefix(WIP_PREFIX) else {
                continue;
            };
            let jobs = self
                .store
                .set_members(&key)
                .await
                .map_err(|e| e.with_tenant(user))?;
            if !jobs.is_empty() {
                out.push(WorkInProgress {
                    user: user.to_string(),
                    jobs,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::seeker::SeekerConfig;
    use crate::jobs::storage::InMemoryStore;

    fn job_store(store: Arc<InMemoryStore>, max: usize) -> JobStore {
        JobStore::new(
            store,
            JobStoreConfig {
                max_queued_jobs: max,
                ..Default::default()
            },
        )
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: Some("localhost".into()),
            port: Some(5432),
            dbname: Some("tenant_db".into()),
            dbuser: Some("tenant".into()),
            pass: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn test_save_then_get_round_trips() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store, 10);
        let job = Job::new("alice", "SELECT 1", params());

        let saved = jobs.save(&job).await.unwrap();
        assert_eq!(saved.job_id, job.job_id);
        assert_eq!(saved.user, "alice");
        assert_eq!(saved.query, JobQuery::Text("SELECT 1".into()));
        assert_eq!(saved.status, JobStatus::Pending);
        assert_eq!(saved.created_at, job.created_at);
        assert_eq!(saved.connection, params());
        assert!(saved.failed_reason.is_none());
        assert!(saved.fallback_status.is_none());
    }

    #[tokio::test]
    async fn test_structured_query_round_trips() {
        let jobs = job_store(Arc::new(InMemoryStore::new()), 10);
        let query = JobQuery::Structured(serde_json::json!({
            "query": [{ "query": "SELECT 1" }, { "query": "SELECT 2" }]
        }));
        let job = Job::new("alice", query.clone(), ConnectionParams::default());

        let saved = jobs.save(&job).await.unwrap();
        assert_eq!(saved.query, query);
    }

    #[tokio::test]
    async fn test_empty_values_read_as_absent() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store.clone(), 10);
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        job.fallback_status = Some(String::new());

        let saved = jobs.save(&job).await.unwrap();
        assert!(saved.fallback_status.is_none());
        assert!(saved.connection.host.is_none());
        assert!(saved.connection.port.is_none());
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let jobs = job_store(Arc::new(InMemoryStore::new()), 10);
        let err = jobs.get(&JobId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_get_with_missing_mandatory_field_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store.clone(), 10);
        let job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        jobs.save(&job).await.unwrap();

        store
            .hash_set(&JobStore::key(&job.job_id), &[("query", String::new())])
            .await
            .unwrap();
        assert!(jobs.get(&job.job_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unrecognised_status_reads_as_unknown() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store.clone(), 10);
        let job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        jobs.save(&job).await.unwrap();

        store
            .hash_set(&JobStore::key(&job.job_id), &[("status", "paused".into())])
            .await
            .unwrap();
        assert_eq!(jobs.get(&job.job_id).await.unwrap().status, JobStatus::Unknown);
    }

    #[tokio::test]
    async fn test_create_enqueues_and_enforces_max() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store.clone(), 1);

        let first = Job::new("alice", "SELECT 1", ConnectionParams::default());
        jobs.create(&first).await.unwrap();
        assert_eq!(jobs.queue().size("alice").await.unwrap(), 1);

        let second = Job::new("alice", "SELECT 2", ConnectionParams::default());
        let err = jobs.create(&second).await.unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(err.tenant(), Some("alice"));
        assert_eq!(err.job_id(), Some(second.job_id.to_string().as_str()));
        assert!(!store.contains_key(&JobStore::key(&second.job_id)));
    }

    #[tokio::test]
    async fn test_create_fails_when_queue_size_unreadable() {
        let store = Arc::new(InMemoryStore::new());
        store
            .hash_set(&TenantQueue::key("T"), &[("oops", "1".to_string())])
            .await
            .unwrap();
        let jobs = job_store(store.clone(), 10);
        let job = Job::new("T", "SELECT 1", params());

        let err = jobs.create(&job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreError);
        assert_eq!(
            err.user_message(),
            "Failed to create job, could not determine user queue size"
        );
        assert_eq!(err.tenant(), Some("T"));
        assert_eq!(err.job_id(), Some(job.job_id.to_string().as_str()));
        assert!(!store.contains_key(&JobStore::key(&job.job_id)));
    }

    #[tokio::test]
    async fn test_create_propagates_failed_existence_check() {
        let store = Arc::new(InMemoryStore::new());
        let job = Job::new("T", "SELECT 1", params());
        store
            .list_push(&JobStore::key(&job.job_id), "not-a-record")
            .await
            .unwrap();
        let jobs = job_store(store.clone(), 10);

        let err = jobs.create(&job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreError);
        assert!(!err.is_not_found());
        assert_eq!(err.tenant(), Some("T"));
        assert_eq!(err.job_id(), Some(job.job_id.to_string().as_str()));
        assert_eq!(jobs.queue().size("T").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_requires_existing_job() {
        let jobs = job_store(Arc::new(InMemoryStore::new()), 10);
        let job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        assert!(jobs.update(&job).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_refuses_terminal_record() {
        let jobs = job_store(Arc::new(InMemoryStore::new()), 10);
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        job.mark_cancelled().unwrap();
        jobs.save(&job).await.unwrap();

        job.status = JobStatus::Running;
        let err = jobs.update(&job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(jobs.get(&job.job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_ttl_only_for_terminal_status() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = job_store(store.clone(), 10);
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        let key = JobStore::key(&job.job_id);

        jobs.save(&job).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        job.mark_running().unwrap();
        jobs.update(&job).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        job.mark_failed("boom").unwrap();
        jobs.update(&job).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), Some(7200));
    }

    #[tokio::test]
    async fn test_save_if_status() {
        let jobs = job_store(Arc::new(InMemoryStore::new()), 10);
        let mut job = Job::new("alice", "SELECT 1", ConnectionParams::default());
        jobs.save(&job).await.unwrap();

        job.mark_running().unwrap();
        let stored = jobs
            .save_if_status(&job, &[JobStatus::Pending])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Running);

        // The stored status is no longer pending, so a second claim is refused.
        assert!(jobs
            .save_if_status(&job, &[JobStatus::Pending])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_work_in_progress_index() {
        let store = Arc::new(InMemoryStore::new());
        let seeker = QueueSeeker::new(store.clone(), SeekerConfig::default());
        let wip = WorkInProgressIndex::new(store, seeker);
        let (a, b) = (JobId::new(), JobId::new());

        wip.add("alice", &a).await.unwrap();
        wip.add("bob", &b).await.unwrap();
        let listed = wip.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].user, "alice");
        assert_eq!(listed[0].jobs, vec![a.to_string()]);

        wip.remove("alice", &a).await.unwrap();
        let listed = wip.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user, "bob");
    }
}

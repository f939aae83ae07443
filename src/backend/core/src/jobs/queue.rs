//! Per-tenant FIFO queues of pending job ids.
//!
//! A tenant with nothing queued has no queue key at all, which is what lets
//! [`QueueSeeker`](super::QueueSeeker) skip idle tenants for free.

use std::sync::Arc;
use tracing::debug;

use super::storage::KeyValueStore;
use super::JobId;
use crate::error::Result;

/// Key prefix for tenant queues.
pub const QUEUE_PREFIX: &str = "batch:queue:";

/// FIFO of job ids per tenant.
#[derive(Clone)]
pub struct TenantQueue {
    store: Arc<dyn KeyValueStore>,
}

impl TenantQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Store key for a tenant's queue.
    pub fn key(tenant: &str) -> String {
        format!("{}{}", QUEUE_PREFIX, tenant)
    }

    /// Tenant name encoded in a queue key, if it is one.
    pub fn tenant_from_key(key: &str) -> Option<&str> {
        key.strip_prefix(QUEUE_PREFIX)
    }

    /// Append a job id to the tail. Returns the new depth.
    pub async fn enqueue(&self, tenant: &str, job_id: &JobId) -> Result<usize> {
        let depth = self
            .store
            .list_push(&Self::key(tenant), &job_id.to_string())
            .await
            .map_err(|e| e.for_job(job_id, tenant))?;
        debug!(user = tenant, job_id = %job_id, depth, "Job enqueued");
        Ok(depth)
    }

    /// Current number of queued ids.
    pub async fn size(&self, tenant: &str) -> Result<usize> {
        self.store
            .list_len(&Self::key(tenant))
            .await
            .map_err(|e| e.with_tenant(tenant))
    }

    /// Remove and return the oldest id, or `None` when the queue is empty.
    ///
    /// Entries that are not valid job ids are dropped and the next one is tried.
    pub async fn dequeue(&self, tenant: &str) -> Result<Option<JobId>> {
        let key = Self::key(tenant);
        loop {
            let raw = self
                .store
                .list_pop(&key)
                .await
                .map_err(|e| e.with_tenant(tenant))?;
            match raw {
                None => return Ok(None),
                Some(raw) => match raw.parse::<JobId>() {
                    Ok(job_id) => {
                        debug!(user = tenant, job_id = %job_id, "Job dequeued");
                        return Ok(Some(job_id));
                    }
                    Err(e) => {
                        tracing::warn!(user = tenant, entry = %raw, error = %e, "Dropping malformed queue entry");
                    }
                },
            }
        }
    }
}

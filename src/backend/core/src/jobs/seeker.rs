//! Cluster-wide discovery of tenants with queued jobs.
//!
//! Discovery walks the keyspace with SCAN restricted to queue keys. The walk
//! stops when the cursor returns to zero or after `max_attempts` pages,
//! whichever comes first, so one scheduling cycle never waits on an
//! unbounded scan. A scan error ends the walk early and yields whatever
//! was collected; the next cycle picks up anything missed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::queue::{TenantQueue, QUEUE_PREFIX};
use super::storage::KeyValueStore;

/// Configuration for queue discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekerConfig {
    /// Maximum SCAN pages per walk
    pub max_attempts: usize,
    /// COUNT hint passed to each SCAN
    pub scan_count: usize,
}

impl Default for SeekerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            scan_count: 100,
        }
    }
}

impl SeekerConfig {
    /// Walk until the scan completes, however many pages that takes.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: usize::MAX,
            ..Default::default()
        }
    }
}

/// Finds tenants whose queue key currently exists.
#[derive(Clone)]
pub struct QueueSeeker {
    store: Arc<dyn KeyValueStore>,
    config: SeekerConfig,
}

impl QueueSeeker {
    pub fn new(store: Arc<dyn KeyValueStore>, config: SeekerConfig) -> Self {
        Self { store, config }
    }

    /// Tenants with at least one queued job, as of scan time.
    pub async fn seek(&self) -> BTreeSet<String> {
        let pattern = format!("{}*", QUEUE_PREFIX);
        self.walk(&pattern)
            .await
            .iter()
            .filter_map(|key| TenantQueue::tenant_from_key(key))
            .map(str::to_string)
            .collect()
    }

    /// Distinct keys matching `pattern`, bounded by the attempt ceiling.
    pub async fn walk(&self, pattern: &str) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        let mut cursor = 0u64;
        let mut attempts = 0usize;

        loop {
            let page = match self.store.scan(cursor, pattern, self.config.scan_count).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        pattern,
                        attempts,
                        found = keys.len(),
                        error = %e,
                        "Scan failed, returning partial results"
                    );
                    break;
                }
            };
            attempts += 1;
            keys.extend(page.keys);
            cursor = page.cursor;

            if cursor == 0 || attempts >= self.config.max_attempts {
                break;
            }
        }

        debug!(pattern, attempts, found = keys.len(), complete = cursor == 0, "Scan walk finished");
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::storage::InMemoryStore;

    async fn store_with_queues(tenants: &[&str]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for tenant in tenants {
            store
                .list_push(&TenantQueue::key(tenant), "00000000-0000-0000-0000-000000000000")
                .await
                .unwrap();
            // Noise the scan has to page past.
            store
                .hash_set(&format!("batch:jobs:{}", tenant), &[("user", tenant.to_string())])
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_seek_finds_every_tenant() {
        let store = store_with_queues(&["a", "b", "c", "d", "e"]).await;
        let seeker = QueueSeeker::new(
            store,
            SeekerConfig {
                scan_count: 2,
                ..SeekerConfig::unbounded()
            },
        );

        let tenants = seeker.seek().await;
        let expected: BTreeSet<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tenants, expected);
    }

    #[tokio::test]
    async fn test_seek_single_attempt_sees_first_page_only() {
        let store = store_with_queues(&["a", "b", "c"]).await;
        // Keys sort as batch:jobs:* then batch:queue:*; one page of 4 reaches only queue "a".
        let seeker = QueueSeeker::new(
            store,
            SeekerConfig {
                max_attempts: 1,
                scan_count: 4,
            },
        );

        let tenants = seeker.seek().await;
        assert_eq!(tenants.into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_seek_returns_partial_results_on_error() {
        let store = store_with_queues(&["a", "b", "c"]).await;
        store.fail_scans_after(2);
        let seeker = QueueSeeker::new(
            store,
            SeekerConfig {
                scan_count: 2,
                ..SeekerConfig::unbounded()
            },
        );

        // Pages: [jobs:a, jobs:b] [jobs:c, queue:a] then failure.
        let tenants = seeker.seek().await;
        assert_eq!(tenants.into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_seek_on_empty_keyspace() {
        let seeker = QueueSeeker::new(Arc::new(InMemoryStore::new()), SeekerConfig::default());
        assert!(seeker.seek().await.is_empty());
    }
}

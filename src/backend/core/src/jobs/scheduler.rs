//! Scheduling cycle: discover tenants, claim one job each, execute.
//!
//! Fairness is per tenant. Each cycle pops at most one id from every
//! discovered queue, so a tenant with a deep backlog gets the same single
//! slot as a tenant with one job. Claims go through a compare-and-set on
//! the stored status, which is what keeps a concurrent cancel from being
//! overwritten.

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ExecutionError, QueryExecutor};
use super::job::{Job, JobId, JobStatus};
use super::seeker::QueueSeeker;
use super::store::{JobStore, WorkInProgressIndex};

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause between cycles (milliseconds)
    pub cycle_interval_ms: u64,
    /// Maximum jobs executing at once within a cycle
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
            concurrency: 4,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════════════

/// Tokens for jobs the scheduler is currently claiming or executing.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `job_id`, replacing any previous one.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id, token.clone());
        token
    }

    pub fn remove(&self, job_id: &JobId) {
        self.tokens.remove(job_id);
    }

    /// Trigger the token for `job_id`. Returns false if nothing is registered.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Running totals across all cycles.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub cycles: Arc<AtomicU64>,
    pub done: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub skipped: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.done.fetch_add(report.done as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.cancelled.fetch_add(report.cancelled as u64, Ordering::Relaxed);
        self.skipped.fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Tenants discovered with a non-empty queue
    pub tenants: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Nothing to run: empty queue, vanished record, or job no longer pending
    pub skipped: usize,
    /// Store errors that prevented a claim or a final write
    pub errors: usize,
}

impl CycleReport {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done => self.done += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Errored => self.errors += 1,
        }
    }

    /// Jobs that reached a terminal status this cycle.
    pub fn finished(&self) -> usize {
        self.done + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Failed,
    Cancelled,
    Skipped,
    Errored,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
            Outcome::Skipped => "skipped",
            Outcome::Errored => "error",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    stats: SchedulerStats,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the cycle in progress finishes.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Wait for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

/// Drives discovery and execution.
pub struct Scheduler {
    jobs: JobStore,
    seeker: QueueSeeker,
    wip: WorkInProgressIndex,
    executor: Arc<dyn QueryExecutor>,
    registry: CancellationRegistry,
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(
        jobs: JobStore,
        seeker: QueueSeeker,
        wip: WorkInProgressIndex,
        executor: Arc<dyn QueryExecutor>,
        registry: CancellationRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            seeker,
            wip,
            executor,
            registry,
            config,
            stats: SchedulerStats::new(),
        }
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Run one cycle to completion.
    pub async fn run_cycle(&self) -> CycleReport {
        let tenants = self.seeker.seek().await;
        let mut report = CycleReport {
            tenants: tenants.len(),
            ..Default::default()
        };

        let outcomes: Vec<Outcome> = stream::iter(tenants)
            .map(|tenant| async move { self.process_tenant(&tenant).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            metrics::counter!(crate::telemetry::names::JOBS_TOTAL, "outcome" => outcome.as_str()).increment(1);
            report.add(outcome);
        }
        self.stats.record(&report);

        if report.tenants > 0 {
            info!(
                tenants = report.tenants,
                done = report.done,
                failed = report.failed,
                cancelled = report.cancelled,
                skipped = report.skipped,
                errors = report.errors,
                "Scheduling cycle finished"
            );
        }
        report
    }

    /// Spawn the recurring loop.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let interval = Duration::from_millis(self.config.cycle_interval_ms);

        let task = tokio::spawn(async move {
            info!(
                interval_ms = self.config.cycle_interval_ms,
                concurrency = self.config.concurrency,
                "Scheduler started"
            );
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                self.run_cycle().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(cycles = self.stats.cycles(), "Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn process_tenant(&self, tenant: &str) -> Outcome {
        match self.jobs.queue().dequeue(tenant).await {
            Ok(Some(job_id)) => self.process_job(tenant, job_id).await,
            Ok(None) => Outcome::Skipped,
            Err(e) => {
                e.log();
                Outcome::Errored
            }
        }
    }

    async fn process_job(&self, tenant: &str, job_id: JobId) -> Outcome {
        let mut job = match self.jobs.get(&job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                debug!(job_id = %job_id, user = tenant, "Queued job no longer exists");
                return Outcome::Skipped;
            }
            Err(e) => {
                e.for_job(job_id, tenant).log();
                return Outcome::Errored;
            }
        };

        if job.status != JobStatus::Pending {
            debug!(job_id = %job_id, user = tenant, status = %job.status, "Queued job is not pending");
            return Outcome::Skipped;
        }

        // Registered before the claim so a cancel racing the claim still finds it.
        let token = self.registry.register(job_id);
        let outcome = self.claim_and_run(&mut job, token).await;
        self.registry.remove(&job_id);
        outcome
    }

    async fn claim_and_run(&self, job: &mut Job, token: CancellationToken) -> Outcome {
        let tenant = job.user.clone();
        if let Err(e) = job.mark_running() {
            e.log();
            return Outcome::Skipped;
        }
        match self.jobs.save_if_status(job, &[JobStatus::Pending]).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(job_id = %job.job_id, user = %tenant, "Job changed before it could be claimed");
                return Outcome::Skipped;
            }
            Err(e) => {
                e.log();
                return Outcome::Errored;
            }
        }

        if let Err(e) = self.wip.add(&tenant, &job.job_id).await {
            e.log();
        }
        info!(job_id = %job.job_id, user = %tenant, "Job running");

        let result = self.executor.execute(job, token).await;

        if let Err(e) = self.wip.remove(&tenant, &job.job_id).await {
            e.log();
        }

        let outcome = match result {
            Ok(()) => job.mark_done().map(|_| Outcome::Done),
            Err(ExecutionError::Failed(reason)) => {
                warn!(job_id = %job.job_id, user = %tenant, reason = %reason, "Job failed");
                job.mark_failed(reason).map(|_| Outcome::Failed)
            }
            Err(ExecutionError::Cancelled) => job.mark_cancelled().map(|_| Outcome::Cancelled),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                e.log();
                return Outcome::Errored;
            }
        };

        match self.jobs.save_if_status(job, &[JobStatus::Running]).await {
            Ok(Some(stored)) => {
                info!(job_id = %stored.job_id, user = %tenant, status = %stored.status, "Job finished");
                outcome
            }
            Ok(None) => {
                // A cancel landed first; its terminal status stands.
                debug!(job_id = %job.job_id, user = %tenant, "Job left running state during execution");
                Outcome::Cancelled
            }
            Err(e) => {
                e.log();
                Outcome::Errored
            }
        }
    }
}

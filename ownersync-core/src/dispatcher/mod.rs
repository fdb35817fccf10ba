//! Job dispatcher.
//!
//! At-least-once delivery through a [`JobQueue`]. A delivered job is
//! invisible to other workers for the visibility window; if the worker does
//! not acknowledge it in time it becomes visible again. Transient failures
//! are never acknowledged: the worker pushes the job's visibility out by the
//! backoff delay and lets it come back.
//!
//! ```text
//! submit ─► Pending ─receive─► Running ─ack─► Succeeded | Failed | Cancelled
//!              ▲                  │
//!              │                  ├─retry_later─► (invisible, then redelivered)
//!              │                  └─attempt cap─► DeadLettered
//!              └──────requeue─────────────────────────┘
//! ```

pub mod memory;
pub mod worker;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::UnitCatalog;
use crate::config::DispatcherConfig;
use crate::error::ReconcileResult;
use crate::ledger::{cancel_mark, IdempotencyLedger};
use crate::types::{Job, JobMode, JobStatus, UnitId};

pub use memory::MemoryQueue;
pub use worker::{Disposition, Worker, WorkerPool};

/// One claimed job. `receipt` identifies this delivery; acknowledging with a
/// stale receipt (after the job was redelivered) has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: Job,
    pub receipt: Uuid,
}

impl Delivery {
    /// 1-based attempt number of this delivery.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }
}

/// Durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Claim the oldest visible job, waiting up to `poll_timeout` for one.
    /// The claim increments `attempts`, marks the job running, and hides it
    /// for `visibility`.
    async fn receive(&self, visibility: Duration, poll_timeout: Duration)
        -> Result<Option<Delivery>>;

    /// Move the job to a terminal `status`. Returns `false` for a stale receipt.
    async fn ack(&self, receipt: Uuid, status: JobStatus, error: Option<&str>) -> Result<bool>;

    /// Leave the job unacknowledged and visible again after `delay`.
    async fn retry_later(&self, receipt: Uuid, delay: Duration, error: &str) -> Result<bool>;

    /// Park a non-terminal job in the dead-letter channel.
    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<bool>;

    /// Put a dead-lettered or failed job back as pending with zero attempts.
    async fn requeue(&self, job_id: Uuid) -> Result<bool>;

    /// Cancel a job that has not been claimed yet.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Dead-lettered jobs, oldest first, with the last failure attached.
    async fn list_dead_letters(&self) -> Result<Vec<Job>>;
}

// ─── Retry policy ─────────────────────────────────────────────

/// Exponential backoff with optional jitter and a cap on attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Deliveries allowed; the delivery numbered `max_attempts` that fails
    /// transiently dead-letters the job.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% on top of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base(),
            max_delay: config.backoff_max(),
            jitter: config.jitter,
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay before the delivery following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            delay.mul_f64(factor).min(self.max_delay)
        } else {
            delay
        }
    }
}

// ─── Dispatcher ───────────────────────────────────────────────

/// Submission and operator surface over the queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn IdempotencyLedger>,
    catalog: Arc<UnitCatalog>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn IdempotencyLedger>,
        catalog: Arc<UnitCatalog>,
    ) -> Self {
        Self {
            queue,
            ledger,
            catalog,
        }
    }

    /// Enqueue a job and return its id immediately. The outcome is read
    /// later from the audit store.
    pub async fn submit(
        &self,
        unit_id: UnitId,
        mode: JobMode,
        requester: &str,
        idempotency_key: Option<String>,
    ) -> ReconcileResult<Uuid> {
        self.catalog.get(&unit_id)?;
        let job = Job::new(unit_id, mode, requester, idempotency_key);
        let job_id = job.job_id;
        tracing::info!(
            job_id = %job_id,
            unit_id = %job.unit_id,
            mode = %job.mode,
            requester = requester,
            key_origin = ?job.key_origin,
            "Job submitted"
        );
        self.queue.enqueue(job).await?;
        Ok(job_id)
    }

    /// Cancel a job that has not been claimed. The ledger mark covers a
    /// worker that claims the job while this call is in flight; that worker
    /// records a cancelled no-op.
    pub async fn cancel(&self, job_id: Uuid) -> ReconcileResult<bool> {
        match self.queue.get_job(job_id).await? {
            Some(job) if job.status == JobStatus::Pending && job.attempts == 0 => {}
            _ => return Ok(false),
        }
        self.ledger.cancel(&cancel_mark(job_id)).await?;
        let cancelled = self.queue.cancel(job_id).await?;
        tracing::info!(job_id = %job_id, cancelled, "Job cancellation requested");
        Ok(cancelled)
    }

    pub async fn dead_letter(&self, job_id: Uuid, reason: &str) -> ReconcileResult<bool> {
        let parked = self.queue.dead_letter(job_id, reason).await?;
        if parked {
            tracing::warn!(job_id = %job_id, reason = reason, "Job dead-lettered by operator");
        }
        Ok(parked)
    }

    /// Resets the attempt count.
    pub async fn requeue(&self, job_id: Uuid) -> ReconcileResult<bool> {
        let requeued = self.queue.requeue(job_id).await?;
        if requeued {
            tracing::info!(job_id = %job_id, "Job requeued");
        }
        Ok(requeued)
    }

    pub async fn list_dead_letters(&self) -> ReconcileResult<Vec<Job>> {
        Ok(self.queue.list_dead_letters().await?)
    }

    pub async fn job(&self, job_id: Uuid) -> ReconcileResult<Option<Job>> {
        Ok(self.queue.get_job(job_id).await?)
    }
}

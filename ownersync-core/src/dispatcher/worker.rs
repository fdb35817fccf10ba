//! Workers pulling jobs off the queue.
//!
//! Each worker is an independent task: receive, execute the workflow, then
//! acknowledge, reschedule, or dead-letter. Workers share nothing in-process
//! except the queue, ledger, and stores they were built with.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Delivery, JobQueue, RetryPolicy};
use crate::config::DispatcherConfig;
use crate::error::ReconcileError;
use crate::types::{JobStatus, RunOutcome};
use crate::workflow::{WorkflowGraph, WorkflowOutcome};

/// How a delivery ended, as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked(JobStatus),
    Retrying,
    DeadLettered,
}

pub struct Worker {
    id: usize,
    queue: Arc<dyn JobQueue>,
    workflow: Arc<WorkflowGraph>,
    retry: RetryPolicy,
    visibility: Duration,
    poll_timeout: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        workflow: Arc<WorkflowGraph>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            id,
            queue,
            workflow,
            retry: RetryPolicy::from_config(config),
            visibility: config.visibility_timeout(),
            poll_timeout: config.poll_timeout(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run until the shutdown signal. A job already claimed is finished
    /// before the loop exits.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker = self.id, "Worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                r = self.queue.receive(self.visibility, self.poll_timeout) => r,
                _ = shutdown_rx.changed() => break,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Worker: failed to receive from queue");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_timeout) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        tracing::info!(worker = self.id, "Worker stopped");
    }

    /// Receive and handle at most one job.
    pub async fn run_once(&self) -> anyhow::Result<Option<Disposition>> {
        match self.queue.receive(self.visibility, self.poll_timeout).await? {
            Some(delivery) => Ok(Some(self.handle(delivery).await)),
            None => Ok(None),
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let job = &delivery.job;
        tracing::debug!(
            worker = self.id,
            job_id = %job.job_id,
            attempt = delivery.attempt(),
            "Worker: job claimed"
        );

        // Redeliveries after an expired visibility window count as attempts.
        if delivery.attempt() > self.retry.max_attempts {
            let err = ReconcileError::Transient(format!(
                "delivered {} times without acknowledgement",
                delivery.attempt()
            ));
            return self.dead_letter(&delivery, &err).await;
        }

        match self.workflow.execute(job).await {
            Ok(outcome) => self.complete(&delivery, outcome).await,
            Err(e) if e.is_retryable() => {
                if self.retry.exhausted(delivery.attempt()) {
                    self.dead_letter(&delivery, &e).await
                } else {
                    self.reschedule(&delivery, &e).await
                }
            }
            Err(e) => self.fail(&delivery, &e).await,
        }
    }

    async fn complete(&self, delivery: &Delivery, outcome: WorkflowOutcome) -> Disposition {
        let run = outcome.run();
        let status = if run.cancelled {
            JobStatus::Cancelled
        } else if run.outcome == RunOutcome::Failed {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };
        self.ack(delivery, status, run.failure.as_deref()).await;
        Disposition::Acked(status)
    }

    async fn reschedule(&self, delivery: &Delivery, error: &ReconcileError) -> Disposition {
        let delay = self.retry.delay_for(delivery.attempt());
        tracing::warn!(
            worker = self.id,
            job_id = %delivery.job.job_id,
            attempt = delivery.attempt(),
            max_attempts = self.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Worker: transient failure, retry scheduled"
        );
        if let Err(e) = self
            .queue
            .retry_later(delivery.receipt, delay, &error.to_string())
            .await
        {
            // The visibility window still brings the job back.
            tracing::error!(job_id = %delivery.job.job_id, error = %e, "Worker: failed to schedule retry");
        }
        Disposition::Retrying
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &ReconcileError) -> Disposition {
        let job = &delivery.job;
        let reason = format!("attempts exhausted ({}): {error}", delivery.attempt());
        tracing::warn!(
            worker = self.id,
            job_id = %job.job_id,
            attempts = delivery.attempt(),
            error = %error,
            "Worker: job dead-lettered after max attempts"
        );
        if let Err(e) = self.queue.dead_letter(job.job_id, &reason).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Worker: failed to dead-letter job");
        }
        if let Err(e) = self.workflow.record_failure(job, error).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Worker: failed to record failure run");
        }
        Disposition::DeadLettered
    }

    async fn fail(&self, delivery: &Delivery, error: &ReconcileError) -> Disposition {
        let job = &delivery.job;
        if let Err(e) = self.workflow.record_failure(job, error).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Worker: failed to record failure run");
        }
        let message = format!("{}: {error}", error.class());
        self.ack(delivery, JobStatus::Failed, Some(&message)).await;
        Disposition::Acked(JobStatus::Failed)
    }

    async fn ack(&self, delivery: &Delivery, status: JobStatus, error: Option<&str>) {
        match self.queue.ack(delivery.receipt, status, error).await {
            Ok(true) => tracing::debug!(
                job_id = %delivery.job.job_id,
                status = status.as_str(),
                "Worker: job acknowledged"
            ),
            Ok(false) => tracing::warn!(
                job_id = %delivery.job.job_id,
                "Worker: stale receipt; job was redelivered before acknowledgement"
            ),
            Err(e) => tracing::error!(
                job_id = %delivery.job.job_id,
                error = %e,
                "Worker: failed to acknowledge job"
            ),
        }
    }
}

/// N workers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        workflow: Arc<WorkflowGraph>,
        config: &DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..config.workers.max(1))
            .map(|id| {
                let worker = Worker::new(id, queue.clone(), workflow.clone(), config);
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(rx).await })
            })
            .collect();
        Self {
            shutdown_tx,
            handles,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

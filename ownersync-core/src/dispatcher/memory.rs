//! In-process job queue.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{Delivery, JobQueue};
use crate::types::{Job, JobStatus};

struct Entry {
    job: Job,
    visible_at: Instant,
    receipt: Option<Uuid>,
}

impl Entry {
    fn deliverable(&self, now: Instant) -> bool {
        matches!(self.job.status, JobStatus::Pending | JobStatus::Running) && self.visible_at <= now
    }

    fn touch(&mut self) {
        self.job.updated_at = Utc::now();
    }
}

/// Jobs keyed by their v7 id, so iteration order is submission order.
#[derive(Default)]
pub struct MemoryQueue {
    entries: Mutex<BTreeMap<Uuid, Entry>>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Claim one deliverable job, or report when the next one becomes visible.
    async fn try_claim(&self, visibility: Duration) -> std::result::Result<Delivery, Option<Instant>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let Some(entry) = entries.values_mut().find(|e| e.deliverable(now)) else {
            let next = entries
                .values()
                .filter(|e| matches!(e.job.status, JobStatus::Pending | JobStatus::Running))
                .map(|e| e.visible_at)
                .min();
            return Err(next);
        };

        let receipt = Uuid::now_v7();
        entry.job.attempts += 1;
        entry.job.status = JobStatus::Running;
        entry.visible_at = now + visibility;
        entry.receipt = Some(receipt);
        entry.touch();
        Ok(Delivery {
            job: entry.job.clone(),
            receipt,
        })
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&job.job_id) {
            bail!("job {} already enqueued", job.job_id);
        }
        entries.insert(
            job.job_id,
            Entry {
                job,
                visible_at: Instant::now(),
                receipt: None,
            },
        );
        drop(entries);
        self.available.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        visibility: Duration,
        poll_timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + poll_timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = match self.try_claim(visibility).await {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next) => next,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = next_visible.map_or(deadline, |at| at.max(now).min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, receipt: Uuid, status: JobStatus, error: Option<&str>) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.values_mut().find(|e| e.receipt == Some(receipt)) else {
            return Ok(false);
        };
        entry.job.status = status;
        entry.job.last_error = error.map(str::to_string);
        entry.receipt = None;
        entry.touch();
        Ok(true)
    }

    async fn retry_later(&self, receipt: Uuid, delay: Duration, error: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.values_mut().find(|e| e.receipt == Some(receipt)) else {
            return Ok(false);
        };
        entry.visible_at = Instant::now() + delay;
        entry.job.last_error = Some(error.to_string());
        entry.receipt = None;
        entry.touch();
        drop(entries);
        self.available.notify_waiters();
        Ok(true)
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&job_id) {
            Some(entry) if !entry.job.status.is_terminal() => {
                entry.job.status = JobStatus::DeadLettered;
                entry.job.last_error = Some(reason.to_string());
                entry.receipt = None;
                entry.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(&self, job_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&job_id) {
            Some(entry)
                if matches!(entry.job.status, JobStatus::DeadLettered | JobStatus::Failed) =>
            {
                entry.job.status = JobStatus::Pending;
                entry.job.attempts = 0;
                entry.visible_at = Instant::now();
                entry.receipt = None;
                entry.touch();
            }
            _ => return Ok(false),
        }
        drop(entries);
        self.available.notify_waiters();
        Ok(true)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&job_id) {
            Some(entry) if entry.job.status == JobStatus::Pending && entry.job.attempts == 0 => {
                entry.job.status = JobStatus::Cancelled;
                entry.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.entries.lock().await.get(&job_id).map(|e| e.job.clone()))
    }

    async fn list_dead_letters(&self) -> Result<Vec<Job>> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.job.status == JobStatus::DeadLettered)
            .map(|e| e.job.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobMode, UnitId};
    use std::sync::Arc;

    fn job() -> Job {
        Job::new(UnitId::new("payments"), JobMode::Mutate, "test", None)
    }

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_empty() {
        let queue = MemoryQueue::new();
        let got = queue
            .receive(VISIBILITY, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_job_is_invisible_until_timeout() {
        let queue = MemoryQueue::new();
        let job = job();
        queue.enqueue(job.clone()).await.unwrap();

        let first = queue
            .receive(VISIBILITY, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job.job_id, job.job_id);
        assert_eq!(first.attempt(), 1);
        assert_eq!(first.job.status, JobStatus::Running);

        assert!(queue
            .receive(VISIBILITY, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        // Unacknowledged: comes back after the window, with a fresh receipt.
        tokio::time::advance(VISIBILITY).await;
        let second = queue
            .receive(VISIBILITY, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt(), 2);
        assert!(!queue.ack(first.receipt, JobStatus::Succeeded, None).await.unwrap());
        assert!(queue.ack(second.receipt, JobStatus::Succeeded, None).await.unwrap());
        assert_eq!(
            queue.get_job(job.job_id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_later_delays_redelivery() {
        let queue = MemoryQueue::new();
        queue.enqueue(job()).await.unwrap();
        let first = queue
            .receive(VISIBILITY, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        queue
            .retry_later(first.receipt, Duration::from_secs(2), "upstream 503")
            .await
            .unwrap();

        let started = Instant::now();
        let second = queue
            .receive(VISIBILITY, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.job.last_error.as_deref(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn test_waiting_receiver_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(VISIBILITY, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job()).await.unwrap();
        let delivery = receiver.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }

    #[tokio::test]
    async fn test_fifo_order_and_terminal_jobs_skipped() {
        let queue = MemoryQueue::new();
        let a = job();
        let b = job();
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();
        assert!(queue.enqueue(a.clone()).await.is_err());
        assert!(queue.cancel(a.job_id).await.unwrap());

        let got = queue
            .receive(VISIBILITY, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.job.job_id, b.job_id);
        assert!(!queue.cancel(b.job_id).await.unwrap());
    }
}

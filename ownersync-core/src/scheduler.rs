//! Periodic audit scheduler.
//!
//! Every tick submits one audit-only job per tracked unit and collects
//! expired ledger entries. Audit jobs never apply, so a tick has no effect
//! on target systems; drift shows up in the recorded runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::catalog::UnitCatalog;
use crate::dispatcher::Dispatcher;
use crate::ledger::IdempotencyLedger;
use crate::types::JobMode;

pub const SCHEDULER_REQUESTER: &str = "scheduler";

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub submitted: Vec<Uuid>,
    pub expired_ledger_entries: usize,
}

pub struct Scheduler {
    dispatcher: Dispatcher,
    catalog: Arc<UnitCatalog>,
    ledger: Arc<dyn IdempotencyLedger>,
    interval: Duration,
    retention: Duration,
}

impl Scheduler {
    pub fn new(
        dispatcher: Dispatcher,
        catalog: Arc<UnitCatalog>,
        ledger: Arc<dyn IdempotencyLedger>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            ledger,
            interval,
            retention,
        }
    }

    /// Submit audit jobs for every unit. A failed submission is logged and
    /// the tick moves on to the next unit.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for unit_id in self.catalog.ids() {
            match self
                .dispatcher
                .submit(unit_id.clone(), JobMode::AuditOnly, SCHEDULER_REQUESTER, None)
                .await
            {
                Ok(job_id) => report.submitted.push(job_id),
                Err(e) => tracing::warn!(
                    unit_id = %unit_id,
                    error = %e,
                    "Scheduler: failed to submit audit job"
                ),
            }
        }

        match self.ledger.collect_expired(self.retention).await {
            Ok(n) => report.expired_ledger_entries = n,
            Err(e) => tracing::warn!(error = %e, "Scheduler: ledger collection failed"),
        }

        tracing::info!(
            submitted = report.submitted.len(),
            expired = report.expired_ledger_entries,
            "Scheduler tick"
        );
        report
    }

    /// Tick on the configured cadence until shutdown. The first tick fires
    /// immediately.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{JobQueue, MemoryQueue};
    use crate::ledger::MemoryLedger;
    use crate::types::{MemberId, ReconciliationUnit, UnitLocator};

    fn scheduler() -> (Scheduler, Arc<MemoryQueue>, Arc<MemoryLedger>) {
        let units = ["billing", "payments"].map(|id| {
            let mut unit = ReconciliationUnit::new(
                id,
                UnitLocator::new("directory", id),
                UnitLocator::new("github", format!("org/{id}")),
            );
            unit.managers.push(MemberId::new("alice"));
            unit
        });
        let catalog = Arc::new(UnitCatalog::new(units).unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher = Dispatcher::new(queue.clone(), ledger.clone(), catalog.clone());
        let scheduler = Scheduler::new(
            dispatcher,
            catalog,
            ledger.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        (scheduler, queue, ledger)
    }

    #[tokio::test]
    async fn test_tick_submits_audit_job_per_unit() {
        let (scheduler, queue, _) = scheduler();
        let report = scheduler.tick().await;
        assert_eq!(report.submitted.len(), 2);

        for job_id in report.submitted {
            let job = queue.get_job(job_id).await.unwrap().unwrap();
            assert_eq!(job.mode, JobMode::AuditOnly);
            assert_eq!(job.requester, SCHEDULER_REQUESTER);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_collects_expired_ledger_entries() {
        let (scheduler, _, ledger) = scheduler();
        ledger.record("old", "h").await.unwrap();
        ledger.complete("old", &serde_json::Value::Null).await.unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;

        assert_eq!(scheduler.tick().await.expired_ledger_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let (scheduler, queue, _) = scheduler();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 60s, 120s; two units each.
        assert_eq!(queue.len().await, 6);
    }
}

//! Shared fixtures for the end-to-end scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use ownersync_core::{
    AuditStore, ConnectorRegistry, Disposition, Engine, EngineBackends, EngineConfig, Job,
    JobStatus, MemberId, MemoryAuditStore, MemoryConnector, MemoryLedger, MemoryQueue, Notifier,
    ReconciliationUnit, Run, RunSummary, StateSnapshot, UnitId, UnitLocator, UnitRef,
};

pub const UNIT: &str = "payments";
pub const SOURCE_REF: &str = "payments";
pub const TARGET_REF: &str = "org/payments";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn payments_unit() -> ReconciliationUnit {
    let mut unit = ReconciliationUnit::new(
        UNIT,
        UnitLocator::new("directory", SOURCE_REF),
        UnitLocator::new("github", TARGET_REF),
    );
    unit.display_name = "Payments".into();
    unit.managers.push(MemberId::new("alice"));
    unit
}

pub fn source() -> StateSnapshot {
    StateSnapshot::new("directory", SOURCE_REF)
}

pub fn target() -> StateSnapshot {
    StateSnapshot::new("github", TARGET_REF)
}

/// Fast timings so retries and polls resolve in milliseconds.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_unit(payments_unit())
        .workers(1)
        .max_attempts(3)
        .scheduler_enabled(false);
    config.dispatcher.poll_timeout_ms = 20;
    config.dispatcher.visibility_timeout_ms = 30_000;
    config.dispatcher.backoff_base_ms = 1;
    config.dispatcher.backoff_max_ms = 5;
    config.dispatcher.jitter = false;
    config.workflow.call_timeout_ms = 1_000;
    config.workflow.job_budget_ms = 10_000;
    config.workflow.lease_poll_interval_ms = 5;
    config
}

/// Captures every summary; optionally fails each delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub summaries: Mutex<Vec<RunSummary>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn count(&self) -> usize {
        self.summaries.lock().await.len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.summaries.lock().await.push(summary.clone());
        if self.fail {
            anyhow::bail!("chat webhook returned 500");
        }
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub source: Arc<MemoryConnector>,
    pub target: Arc<MemoryConnector>,
    pub queue: Arc<MemoryQueue>,
    pub ledger: Arc<MemoryLedger>,
    pub audit: Arc<MemoryAuditStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(source: StateSnapshot, target: StateSnapshot) -> Harness {
    harness_with(source, target, test_config(), RecordingNotifier::default(), None)
}

pub fn harness_with(
    source: StateSnapshot,
    target: StateSnapshot,
    config: EngineConfig,
    notifier: RecordingNotifier,
    target_latency: Option<Duration>,
) -> Harness {
    init_tracing();
    let source = Arc::new(MemoryConnector::new("directory").with_unit(source));
    let mut target_connector = MemoryConnector::new("github").with_unit(target);
    if let Some(latency) = target_latency {
        target_connector = target_connector.with_latency(latency);
    }
    let target = Arc::new(target_connector);

    let queue = Arc::new(MemoryQueue::new());
    let ledger = Arc::new(MemoryLedger::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let notifier = Arc::new(notifier);
    let backends = EngineBackends {
        queue: queue.clone(),
        ledger: ledger.clone(),
        audit: audit.clone(),
        notifier: notifier.clone(),
    };
    let connectors = ConnectorRegistry::new()
        .with(source.clone())
        .with(target.clone());
    let engine = Engine::new(config, connectors, backends).expect("engine");

    Harness {
        engine,
        source,
        target,
        queue,
        ledger,
        audit,
        notifier,
    }
}

impl Harness {
    /// Handle jobs on one worker until the queue stays empty for a poll.
    pub async fn drain(&self) -> Vec<Disposition> {
        let worker = self.engine.worker(0);
        let mut handled = Vec::new();
        while let Some(disposition) = worker.run_once().await.expect("queue") {
            handled.push(disposition);
            assert!(handled.len() < 100, "queue never drained");
        }
        handled
    }

    pub async fn submit_mutate(&self, key: Option<&str>) -> Uuid {
        self.engine
            .dispatcher()
            .submit(
                UnitId::new(UNIT),
                ownersync_core::JobMode::Mutate,
                "test",
                key.map(str::to_string),
            )
            .await
            .expect("submit")
    }

    pub async fn submit_audit(&self) -> Uuid {
        self.engine
            .dispatcher()
            .submit(
                UnitId::new(UNIT),
                ownersync_core::JobMode::AuditOnly,
                "test",
                None,
            )
            .await
            .expect("submit")
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.engine
            .dispatcher()
            .job(job_id)
            .await
            .expect("queue")
            .expect("job exists")
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_terminal(&self, job_id: Uuid) -> Job {
        for _ in 0..500 {
            let job = self.job(job_id).await;
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal status");
    }

    pub async fn runs(&self) -> Vec<Run> {
        self.audit
            .list_runs(&UnitId::new(UNIT), chrono::Utc::now() - chrono::Duration::days(1))
            .await
            .expect("audit")
    }

    pub async fn runs_for(&self, job_id: Uuid) -> Vec<Run> {
        self.runs()
            .await
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect()
    }

    pub async fn target_state(&self) -> StateSnapshot {
        self.target
            .unit(&UnitRef::new(TARGET_REF))
            .await
            .expect("target unit")
    }

    pub async fn status(&self, job_id: Uuid) -> JobStatus {
        self.job(job_id).await.status
    }
}

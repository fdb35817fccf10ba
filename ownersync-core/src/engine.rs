//! Engine assembly.
//!
//! Builds the catalog, dispatcher, workflow graph, workers, and scheduler
//! from an [`EngineConfig`], a connector registry, and storage backends.
//! Everything is injected; nothing is global.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{AuditStore, MemoryAuditStore};
use crate::catalog::UnitCatalog;
use crate::config::EngineConfig;
use crate::connector::ConnectorRegistry;
use crate::dispatcher::{Dispatcher, JobQueue, MemoryQueue, Worker, WorkerPool};
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::{IdempotencyLedger, MemoryLedger};
use crate::notify::{LogNotifier, Notifier};
use crate::scheduler::Scheduler;
use crate::types::{Run, UnitId};
use crate::workflow::WorkflowGraph;

/// Storage and notification backends.
#[derive(Clone)]
pub struct EngineBackends {
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub audit: Arc<dyn AuditStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl EngineBackends {
    /// Everything in process; state is lost on restart.
    pub fn in_memory() -> Self {
        Self {
            queue: Arc::new(MemoryQueue::new()),
            ledger: Arc::new(MemoryLedger::new()),
            audit: Arc::new(MemoryAuditStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<UnitCatalog>,
    backends: EngineBackends,
    dispatcher: Dispatcher,
    workflow: Arc<WorkflowGraph>,
}

impl Engine {
    /// Fails when a unit is invalid or refers to a system with no connector.
    pub fn new(
        config: EngineConfig,
        connectors: ConnectorRegistry,
        backends: EngineBackends,
    ) -> ReconcileResult<Self> {
        // A job still inside its budget must not become visible to another worker.
        if config.dispatcher.visibility_timeout() <= config.workflow.job_budget() {
            return Err(ReconcileError::Validation(format!(
                "visibility_timeout_ms ({}) must exceed job_budget_ms ({})",
                config.dispatcher.visibility_timeout_ms, config.workflow.job_budget_ms
            )));
        }

        let catalog = Arc::new(UnitCatalog::new(config.units.clone())?);
        for unit_id in catalog.ids() {
            let unit = catalog.get(unit_id)?;
            for system in [&unit.source.system, &unit.target.system] {
                connectors.get(system).map_err(|_| {
                    ReconcileError::Validation(format!(
                        "unit '{unit_id}' refers to unregistered system '{system}'"
                    ))
                })?;
            }
        }

        let dispatcher = Dispatcher::new(
            backends.queue.clone(),
            backends.ledger.clone(),
            catalog.clone(),
        );
        let workflow = Arc::new(WorkflowGraph::new(
            catalog.clone(),
            connectors,
            backends.ledger.clone(),
            backends.audit.clone(),
            backends.notifier.clone(),
            config.workflow.clone(),
        ));

        tracing::info!(
            units = catalog.len(),
            workers = config.dispatcher.workers,
            "Engine assembled"
        );

        Ok(Self {
            config,
            catalog,
            backends,
            dispatcher,
            workflow,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &UnitCatalog {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn workflow(&self) -> Arc<WorkflowGraph> {
        self.workflow.clone()
    }

    /// A standalone worker, for driving the queue by hand (tests, one-shot runs).
    pub fn worker(&self, id: usize) -> Worker {
        Worker::new(
            id,
            self.backends.queue.clone(),
            self.workflow.clone(),
            &self.config.dispatcher,
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.dispatcher.clone(),
            self.catalog.clone(),
            self.backends.ledger.clone(),
            self.config.scheduler.interval(),
            self.config.ledger.retention(),
        )
    }

    pub async fn list_runs(&self, unit_id: &UnitId, since: DateTime<Utc>) -> ReconcileResult<Vec<Run>> {
        Ok(self.backends.audit.list_runs(unit_id, since).await?)
    }

    pub async fn get_run(&self, run_id: Uuid) -> ReconcileResult<Option<Run>> {
        Ok(self.backends.audit.get_run(run_id).await?)
    }

    /// Spawn the worker pool and, if enabled, the scheduler.
    pub fn start(&self) -> EngineHandle {
        let pool = WorkerPool::spawn(
            self.backends.queue.clone(),
            self.workflow.clone(),
            &self.config.dispatcher,
        );

        let scheduler = self.config.scheduler.enabled.then(|| {
            let (tx, rx) = watch::channel(false);
            let scheduler = self.scheduler();
            let handle = tokio::spawn(async move { scheduler.run(rx).await });
            (tx, handle)
        });

        EngineHandle { pool, scheduler }
    }
}

/// Running engine tasks.
pub struct EngineHandle {
    pool: WorkerPool,
    scheduler: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl EngineHandle {
    pub fn workers(&self) -> usize {
        self.pool.len()
    }

    /// Stop the scheduler, then drain the workers.
    pub async fn shutdown(self) {
        if let Some((tx, handle)) = self.scheduler {
            let _ = tx.send(true);
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }
        self.pool.shutdown().await;
        tracing::info!("Engine stopped");
    }
}

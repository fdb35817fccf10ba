//! ownersync-core - ownership reconciliation engine.
//!
//! Keeps "who owns / administers this unit" in line between a source of
//! record and external systems. Jobs go through a durable queue, each job
//! runs a fixed workflow (fetch both sides, diff, apply, record, notify),
//! and every mutation is keyed through an idempotency ledger so retries and
//! redeliveries never repeat a side effect.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ownersync_core::{
//!     ConnectorRegistry, Engine, EngineBackends, EngineConfig, JobMode, MemoryConnector, UnitId,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = EngineConfig::load_from_file("ownersync.yaml".as_ref())?;
//! let connectors = ConnectorRegistry::new()
//!     .with(Arc::new(MemoryConnector::new("directory")))
//!     .with(Arc::new(MemoryConnector::new("github")));
//! let engine = Engine::new(config, connectors, EngineBackends::in_memory())?;
//!
//! let handle = engine.start();
//! let job_id = engine
//!     .dispatcher()
//!     .submit(UnitId::new("payments"), JobMode::Mutate, "alice", None)
//!     .await?;
//! # let _ = job_id;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod diff;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod scheduler;
pub mod types;
pub mod workflow;

// Postgres backends (when enabled)
#[cfg(feature = "postgres")]
pub mod postgres;

pub use apply::{ApplyEngine, ApplyReport, PartialFailurePolicy};
pub use audit::{AuditStore, MemoryAuditStore};
pub use catalog::UnitCatalog;
pub use config::{DispatcherConfig, EngineConfig, LedgerConfig, SchedulerConfig, WorkflowConfig};
pub use connector::{Connector, ConnectorError, ConnectorRegistry, MemoryConnector};
pub use diff::DiffOptions;
pub use dispatcher::{
    Delivery, Dispatcher, Disposition, JobQueue, MemoryQueue, RetryPolicy, Worker, WorkerPool,
};
pub use engine::{Engine, EngineBackends, EngineHandle};
pub use error::{ErrorClass, ReconcileError, ReconcileResult};
pub use ledger::{IdempotencyLedger, LedgerRecord, MemoryLedger};
pub use notify::{LogNotifier, Notifier};
pub use scheduler::Scheduler;
pub use types::*;
pub use workflow::{Step, WorkflowGraph, WorkflowOutcome};

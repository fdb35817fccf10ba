//! Idempotency ledger.
//!
//! The ledger is the only piece of state workers share besides the queue.
//! It answers three questions:
//!
//! - has this logical operation been seen before, and with what result
//!   (`record` / `complete` / `release`)
//! - was this job cancelled before it was claimed (`cancel` / `is_cancelled`)
//! - who may mutate this unit right now (`acquire_lease` / `release_lease`)
//!
//! `record` is linearized per key: of any number of concurrent callers with
//! the same key, exactly one observes [`LedgerRecord::FirstTime`].

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ReconcileResult;

pub use memory::MemoryLedger;

/// Answer to [`IdempotencyLedger::record`].
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerRecord {
    /// The caller owns the key and must `complete` or `release` it.
    FirstTime,
    /// Someone recorded the key before. `stored` is `None` while the first
    /// holder is still in flight (or died before completing).
    Duplicate { stored: Option<serde_json::Value> },
}

/// Persistence trait for ledger state. In-memory for tests and single-process
/// use, Postgres (feature `database`) for real deployments.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    // ── Keys ──

    /// Fails with `ReconcileError::Conflict` when `key` was recorded with a
    /// different `payload_hash`.
    async fn record(&self, key: &str, payload_hash: &str) -> ReconcileResult<LedgerRecord>;

    /// Attach the result for `key`. The first completion wins.
    async fn complete(&self, key: &str, result: &serde_json::Value) -> anyhow::Result<()>;

    /// Forget an in-flight (not completed) entry so a retry starts fresh.
    async fn release(&self, key: &str) -> anyhow::Result<()>;

    // ── Cancellation ──

    /// Returns `false` if the mark already existed.
    async fn cancel(&self, name: &str) -> anyhow::Result<bool>;
    async fn is_cancelled(&self, name: &str) -> anyhow::Result<bool>;

    // ── Leases ──

    /// Take or renew the lease `name` for `holder`. Returns `false` while
    /// another holder's lease is unexpired.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool>;
    async fn release_lease(&self, name: &str, holder: &str) -> anyhow::Result<()>;

    // ── Retention ──

    /// Drop completed entries and cancel marks older than `retention`.
    /// Returns how many.
    async fn collect_expired(&self, retention: Duration) -> anyhow::Result<usize>;
}

/// Result stored under a job's idempotency key once its run is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRun {
    pub run_id: uuid::Uuid,
    pub outcome: crate::types::RunOutcome,
}

/// Lease name serializing mutate jobs for one unit.
pub fn unit_lease_name(unit_id: &crate::types::UnitId) -> String {
    format!("unit-mutate:{unit_id}")
}

/// Lease name held by whichever job is executing under `idempotency_key`.
pub fn job_lease_name(idempotency_key: &str) -> String {
    format!("job-key:{idempotency_key}")
}

/// Cancellation mark name for one job.
pub fn cancel_mark(job_id: uuid::Uuid) -> String {
    format!("job-cancel:{job_id}")
}

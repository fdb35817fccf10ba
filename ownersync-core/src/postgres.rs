//! Postgres backends for the ledger, job queue, and audit store.
//!
//! Schema lives in `migrations/0001_ownersync.sql`; [`migrate`] applies it.
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers in any
//! number of processes can share one queue.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::dispatcher::{Delivery, JobQueue};
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::{IdempotencyLedger, LedgerRecord};
use crate::types::{Job, JobMode, JobStatus, KeyOrigin, Run, UnitId};

const SCHEMA: &str = include_str!("../migrations/0001_ownersync.sql");

/// How often `receive` re-polls an empty queue.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Create tables and indexes if missing.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("Failed to apply ownersync schema")?;
    Ok(())
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

// ─── Ledger ───────────────────────────────────────────────────

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PgLedger {
    async fn record(&self, key: &str, payload_hash: &str) -> ReconcileResult<LedgerRecord> {
        // A concurrent release can delete the row between the insert and the
        // read; one more round settles it.
        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO ownersync_ledger (key, payload_hash)
                VALUES ($1, $2)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(payload_hash)
            .execute(&self.pool)
            .await
            .context("Failed to insert ledger entry")?;

            if inserted.rows_affected() == 1 {
                return Ok(LedgerRecord::FirstTime);
            }

            let row = sqlx::query("SELECT payload_hash, result FROM ownersync_ledger WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read ledger entry")?;

            let Some(row) = row else { continue };
            let stored_hash: String = row.try_get("payload_hash").map_err(anyhow::Error::from)?;
            if stored_hash != payload_hash {
                return Err(ReconcileError::Conflict {
                    key: key.to_string(),
                    stored_hash,
                    offered_hash: payload_hash.to_string(),
                });
            }
            let stored: Option<serde_json::Value> =
                row.try_get("result").map_err(anyhow::Error::from)?;
            return Ok(LedgerRecord::Duplicate { stored });
        }
        Err(ReconcileError::Transient(format!(
            "ledger key '{key}' changed concurrently"
        )))
    }

    async fn complete(&self, key: &str, result: &serde_json::Value) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_ledger
            SET result = $2, completed_at = now()
            WHERE key = $1 AND result IS NULL
            "#,
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("Failed to complete ledger entry")?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ownersync_ledger WHERE key = $1)")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await
                    .context("Failed to check ledger entry")?;
            if !exists {
                bail!("ledger key '{key}' was never recorded");
            }
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM ownersync_ledger WHERE key = $1 AND result IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to release ledger entry")?;
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO ownersync_cancellations (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .context("Failed to record cancellation")?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn is_cancelled(&self, name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM ownersync_cancellations WHERE name = $1)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check cancellation")?;
        Ok(exists)
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ownersync_leases (name, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE ownersync_leases.holder = EXCLUDED.holder
                   OR ownersync_leases.expires_at <= now()
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(secs(ttl))
        .execute(&self.pool)
        .await
        .context("Failed to acquire lease")?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM ownersync_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .context("Failed to release lease")?;
        Ok(())
    }

    async fn collect_expired(&self, retention: Duration) -> Result<usize> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM ownersync_ledger
            WHERE completed_at IS NOT NULL
              AND completed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(secs(retention))
        .execute(&self.pool)
        .await
        .context("Failed to collect expired ledger entries")?;
        let marks = sqlx::query(
            r#"
            DELETE FROM ownersync_cancellations
            WHERE created_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(secs(retention))
        .execute(&self.pool)
        .await
        .context("Failed to collect expired cancel marks")?;
        Ok((deleted.rows_affected() + marks.rows_affected()) as usize)
    }
}

// ─── Job queue ────────────────────────────────────────────────

const JOB_COLUMNS: &str = "job_id, unit_id, requester, idempotency_key, key_origin, mode, \
                           attempts, status, last_error, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job> {
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let key_origin: String = row.try_get("key_origin")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(Job {
        job_id: row.try_get("job_id")?,
        unit_id: UnitId::new(row.try_get::<String, _>("unit_id")?),
        requester: row.try_get("requester")?,
        idempotency_key: row.try_get("idempotency_key")?,
        key_origin: KeyOrigin::parse(&key_origin)
            .with_context(|| format!("unknown key origin '{key_origin}'"))?,
        mode: JobMode::parse(&mode).with_context(|| format!("unknown job mode '{mode}'"))?,
        attempts: attempts.max(0) as u32,
        status: JobStatus::parse(&status)
            .with_context(|| format!("unknown job status '{status}'"))?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_claim(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let receipt = Uuid::now_v7();
        let row = sqlx::query(&format!(
            r#"
            UPDATE ownersync_jobs
            SET attempts = attempts + 1,
                status = 'running',
                receipt = $1,
                visible_at = now() + make_interval(secs => $2),
                updated_at = now()
            WHERE job_id = (
                SELECT job_id FROM ownersync_jobs
                WHERE status IN ('pending', 'running') AND visible_at <= now()
                ORDER BY created_at, job_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(receipt)
        .bind(secs(visibility))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim job")?;

        row.map(|row| -> Result<Delivery> {
            Ok(Delivery {
                job: job_from_row(&row)?,
                receipt,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ownersync_jobs
                (job_id, unit_id, requester, idempotency_key, key_origin, mode,
                 attempts, status, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.job_id)
        .bind(job.unit_id.as_str())
        .bind(&job.requester)
        .bind(&job.idempotency_key)
        .bind(job.key_origin.as_str())
        .bind(job.mode.as_str())
        .bind(job.attempts as i32)
        .bind(job.status.as_str())
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?;
        Ok(())
    }

    async fn receive(
        &self,
        visibility: Duration,
        poll_timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + poll_timeout;
        loop {
            if let Some(delivery) = self.try_claim(visibility).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, receipt: Uuid, status: JobStatus, error: Option<&str>) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_jobs
            SET status = $2, last_error = $3, receipt = NULL, updated_at = now()
            WHERE receipt = $1
            "#,
        )
        .bind(receipt)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to acknowledge job")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn retry_later(&self, receipt: Uuid, delay: Duration, error: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_jobs
            SET visible_at = now() + make_interval(secs => $2),
                last_error = $3, receipt = NULL, updated_at = now()
            WHERE receipt = $1
            "#,
        )
        .bind(receipt)
        .bind(secs(delay))
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule job")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_jobs
            SET status = 'dead_lettered', last_error = $2, receipt = NULL, updated_at = now()
            WHERE job_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to dead-letter job")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn requeue(&self, job_id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_jobs
            SET status = 'pending', attempts = 0, visible_at = now(),
                receipt = NULL, updated_at = now()
            WHERE job_id = $1 AND status IN ('dead_lettered', 'failed')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to requeue job")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE ownersync_jobs
            SET status = 'cancelled', updated_at = now()
            WHERE job_id = $1 AND status = 'pending' AND attempts = 0
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel job")?;
        Ok(updated.rows_affected() == 1)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ownersync_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_dead_letters(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ownersync_jobs \
             WHERE status = 'dead_lettered' ORDER BY created_at, job_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list dead letters")?;
        rows.iter().map(job_from_row).collect()
    }
}

// ─── Audit store ──────────────────────────────────────────────

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    let record: serde_json::Value = row.try_get("record")?;
    serde_json::from_value(record).context("Corrupt run record")
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn put_run(&self, run: &Run) -> Result<()> {
        let record = serde_json::to_value(run).context("Failed to serialize run")?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO ownersync_runs (run_id, job_id, unit_id, outcome, started_at, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run.run_id)
        .bind(run.job_id)
        .bind(run.unit_id.as_str())
        .bind(run.outcome.as_str())
        .bind(run.started_at)
        .bind(&record)
        .execute(&self.pool)
        .await
        .context("Failed to insert run")?;

        if inserted.rows_affected() == 0 {
            bail!("run {} already recorded", run.run_id);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT record FROM ownersync_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, unit_id: &UnitId, since: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM ownersync_runs
            WHERE unit_id = $1 AND started_at >= $2
            ORDER BY started_at, run_id
            "#,
        )
        .bind(unit_id.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;
        rows.iter().map(run_from_row).collect()
    }
}

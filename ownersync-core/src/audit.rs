//! Audit store: write-once run records.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Run, UnitId};

/// Persistence for [`Run`] records. A run is written exactly once; a second
/// `put_run` with the same id is an error.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn put_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;
    /// Runs for `unit_id` started at or after `since`, oldest first.
    async fn list_runs(&self, unit_id: &UnitId, since: DateTime<Utc>) -> Result<Vec<Run>>;
}

#[derive(Default)]
pub struct MemoryAuditStore {
    runs: RwLock<BTreeMap<Uuid, Run>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn put_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            bail!("run {} already recorded", run.run_id);
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, unit_id: &UnitId, since: DateTime<Utc>) -> Result<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|r| &r.unit_id == unit_id && r.started_at >= since)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.started_at, r.run_id));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobMode, RunOutcome};

    fn run(unit: &str, started_at: DateTime<Utc>) -> Run {
        Run {
            run_id: Uuid::now_v7(),
            job_id: Uuid::now_v7(),
            unit_id: UnitId::new(unit),
            mode: JobMode::AuditOnly,
            correlation_id: "corr".into(),
            source_before: None,
            target_before: None,
            target_after: None,
            operations: Vec::new(),
            outcome: RunOutcome::NoOp,
            steps: Vec::new(),
            cancelled: false,
            failure: None,
            started_at,
            finished_at: started_at,
        }
    }

    #[tokio::test]
    async fn test_runs_are_write_once() {
        let store = MemoryAuditStore::new();
        let r = run("payments", Utc::now());
        store.put_run(&r).await.unwrap();
        assert!(store.put_run(&r).await.is_err());
        assert_eq!(store.get_run(r.run_id).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_unit_and_time() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        let old = run("payments", now - chrono::Duration::hours(2));
        let recent = run("payments", now);
        let other = run("billing", now);
        for r in [&old, &recent, &other] {
            store.put_run(r).await.unwrap();
        }

        let listed = store
            .list_runs(&UnitId::new("payments"), now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(listed, vec![recent]);

        let all = store
            .list_runs(&UnitId::new("payments"), now - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, old.run_id);
    }
}

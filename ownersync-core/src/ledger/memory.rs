//! In-process ledger backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{IdempotencyLedger, LedgerRecord};
use crate::error::{ReconcileError, ReconcileResult};

struct Entry {
    payload_hash: String,
    result: Option<serde_json::Value>,
    completed_at: Option<Instant>,
}

struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<String, Entry>,
    cancelled: HashMap<String, Instant>,
    leases: HashMap<String, Lease>,
}

/// Single mutex over all ledger state; every operation is one critical
/// section, which is what linearizes `record`.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn record(&self, key: &str, payload_hash: &str) -> ReconcileResult<LedgerRecord> {
        let mut state = self.state.lock().await;
        match state.entries.get(key) {
            Some(entry) if entry.payload_hash != payload_hash => Err(ReconcileError::Conflict {
                key: key.to_string(),
                stored_hash: entry.payload_hash.clone(),
                offered_hash: payload_hash.to_string(),
            }),
            Some(entry) => Ok(LedgerRecord::Duplicate {
                stored: entry.result.clone(),
            }),
            None => {
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        payload_hash: payload_hash.to_string(),
                        result: None,
                        completed_at: None,
                    },
                );
                Ok(LedgerRecord::FirstTime)
            }
        }
    }

    async fn complete(&self, key: &str, result: &serde_json::Value) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("ledger key '{key}' was never recorded"))?;
        if entry.result.is_none() {
            entry.result = Some(result.clone());
            entry.completed_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state
            .entries
            .get(key)
            .is_some_and(|entry| entry.result.is_none())
        {
            state.entries.remove(key);
        }
        Ok(())
    }

    async fn cancel(&self, name: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if state.cancelled.contains_key(name) {
            return Ok(false);
        }
        state.cancelled.insert(name.to_string(), Instant::now());
        Ok(true)
    }

    async fn is_cancelled(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().await.cancelled.contains_key(name))
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let free = match state.leases.get(name) {
            None => true,
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
        };
        if free {
            state.leases.insert(
                name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(free)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(name)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(name);
        }
        Ok(())
    }

    async fn collect_expired(&self, retention: Duration) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| match entry.completed_at {
            Some(at) => at + retention > now,
            None => true,
        });
        let marks = state.cancelled.len();
        state.cancelled.retain(|_, at| *at + retention > now);
        Ok(before - state.entries.len() + marks - state.cancelled.len())
    }
}

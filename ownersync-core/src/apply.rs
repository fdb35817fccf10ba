//! Apply engine.
//!
//! Executes planned change operations against a connector, one at a time, in
//! diff order. Each operation gets the key `{base_key}:{index}` and goes
//! through the ledger first, so a retried batch replays stored outcomes
//! instead of calling the connector again.
//!
//! A batch holding a destructive removal runs its manager additions first.
//! If one of them fails the batch aborts before anything is removed, so the
//! unit keeps at least one manager. Without any manager addition the batch
//! is rejected in pre-flight. Records are always reported in diff order.
//!
//! Failure handling per operation:
//!
//! ```text
//! Ok(outcome)           → recorded, stored in ledger
//! Permanent error       → recorded as Failed, stored in ledger
//! Transient error       → ledger entry released, whole step fails (retry)
//! Conflict from ledger  → whole step fails (never retried)
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connector::{with_call_timeout, Connector};
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::{IdempotencyLedger, LedgerRecord};
use crate::types::{ChangeOperation, OperationOutcome, OperationRecord, RunOutcome, UnitRef};

/// What to do after an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Stop at the first failure; destructive operations are rejected before
    /// anything runs.
    AbortOnFirstFailure,
    /// Keep going; maximizes convergence for additive batches.
    BestEffortContinue,
}

impl PartialFailurePolicy {
    /// Any destructive operation forces abort-on-first-failure.
    pub fn effective(operations: &[ChangeOperation], requested: Option<Self>) -> Self {
        if operations.iter().any(|op| op.destructive) {
            Self::AbortOnFirstFailure
        } else {
            requested.unwrap_or(Self::BestEffortContinue)
        }
    }
}

/// Per-operation detail plus the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub policy: PartialFailurePolicy,
    pub outcome: RunOutcome,
    pub records: Vec<OperationRecord>,
}

impl ApplyReport {
    pub fn successful_operations(&self) -> Vec<ChangeOperation> {
        self.records
            .iter()
            .filter(|r| r.outcome.is_success())
            .map(|r| r.operation.clone())
            .collect()
    }
}

pub fn operation_key(base_key: &str, index: usize) -> String {
    format!("{base_key}:{index}")
}

/// `applied` when every operation succeeded, `failed` when none did,
/// `partial_failure` otherwise. No operations is `no_op`.
pub fn aggregate(records: &[OperationRecord]) -> RunOutcome {
    if records.is_empty() {
        return RunOutcome::NoOp;
    }
    let succeeded = records.iter().filter(|r| r.outcome.is_success()).count();
    if succeeded == records.len() {
        RunOutcome::Applied
    } else if succeeded == 0 {
        RunOutcome::Failed
    } else {
        RunOutcome::PartialFailure
    }
}

pub struct ApplyEngine {
    ledger: Arc<dyn IdempotencyLedger>,
    call_timeout: Duration,
}

impl ApplyEngine {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>, call_timeout: Duration) -> Self {
        Self {
            ledger,
            call_timeout,
        }
    }

    /// Assign keys and execute `operations`, manager additions first when the
    /// batch would otherwise drop the last manager.
    pub async fn apply_all(
        &self,
        connector: &dyn Connector,
        unit: &UnitRef,
        operations: Vec<ChangeOperation>,
        base_key: &str,
        policy: Option<PartialFailurePolicy>,
    ) -> ReconcileResult<ApplyReport> {
        let policy = PartialFailurePolicy::effective(&operations, policy);
        let planned = plan(operations, base_key);

        if policy == PartialFailurePolicy::AbortOnFirstFailure {
            if let Some(records) = preflight(&planned) {
                warn!(
                    unit = %unit,
                    operations = records.len(),
                    "Destructive operation rejected before execution"
                );
                return Ok(ApplyReport {
                    policy,
                    outcome: RunOutcome::Failed,
                    records,
                });
            }
        }

        let mut records = Vec::with_capacity(planned.len());
        let mut aborted_at: Option<usize> = None;
        for (index, operation) in execution_order(planned) {
            if let Some(failed) = aborted_at {
                records.push(OperationRecord {
                    index,
                    operation,
                    outcome: OperationOutcome::Skipped {
                        reason: format!("aborted after operation {failed} failed"),
                    },
                    replayed: false,
                });
                continue;
            }

            let record = self.apply_one(connector, unit, index, operation).await?;
            if !record.outcome.is_success() && policy == PartialFailurePolicy::AbortOnFirstFailure {
                aborted_at = Some(index);
            }
            records.push(record);
        }
        records.sort_by_key(|r| r.index);

        Ok(ApplyReport {
            policy,
            outcome: aggregate(&records),
            records,
        })
    }

    async fn apply_one(
        &self,
        connector: &dyn Connector,
        unit: &UnitRef,
        index: usize,
        operation: ChangeOperation,
    ) -> ReconcileResult<OperationRecord> {
        let key = operation
            .idempotency_key
            .clone()
            .ok_or_else(|| ReconcileError::Validation(format!("operation {index} has no key")))?;

        match self.ledger.record(&key, &operation.payload_hash()).await? {
            LedgerRecord::Duplicate {
                stored: Some(stored),
            } => {
                let outcome: OperationOutcome = serde_json::from_value(stored)
                    .map_err(|e| anyhow::anyhow!("corrupt ledger result for '{key}': {e}"))?;
                debug!(key = %key, op = %operation, "Replaying stored operation outcome");
                return Ok(OperationRecord {
                    index,
                    operation,
                    outcome,
                    replayed: true,
                });
            }
            LedgerRecord::Duplicate { stored: None } => {
                // Holder died between record and complete. The connector
                // contract makes a repeat call with the same key safe.
                warn!(key = %key, op = %operation, "Operation key in flight without result; re-invoking connector");
            }
            LedgerRecord::FirstTime => {}
        }

        let call = with_call_timeout(
            connector.system(),
            self.call_timeout,
            connector.apply(unit, &operation, &key),
        )
        .await;

        let outcome = match call {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                self.ledger.release(&key).await?;
                return Err(e.into());
            }
            Err(e) => {
                warn!(key = %key, op = %operation, error = %e, "Operation failed permanently");
                OperationOutcome::Failed {
                    class: e.class(),
                    message: e.to_string(),
                }
            }
        };

        let stored = serde_json::to_value(&outcome).map_err(anyhow::Error::from)?;
        self.ledger.complete(&key, &stored).await?;

        Ok(OperationRecord {
            index,
            operation,
            outcome,
            replayed: false,
        })
    }
}

fn plan(operations: Vec<ChangeOperation>, base_key: &str) -> Vec<ChangeOperation> {
    operations
        .into_iter()
        .enumerate()
        .map(|(index, mut op)| {
            op.idempotency_key = Some(operation_key(base_key, index));
            op
        })
        .collect()
}

fn adds_manager(op: &ChangeOperation) -> bool {
    op.after.as_ref().is_some_and(|role| role.is_manager())
}

/// Indexed operations in the order they run: when the batch holds a
/// destructive removal, manager additions move to the front.
fn execution_order(planned: Vec<ChangeOperation>) -> Vec<(usize, ChangeOperation)> {
    let guarded = planned.iter().any(|op| op.destructive);
    let mut ordered: Vec<(usize, ChangeOperation)> = planned.into_iter().enumerate().collect();
    if guarded {
        ordered.sort_by_key(|(_, op)| !adds_manager(op));
    }
    ordered
}

/// Reject the whole batch if a destructive operation has no replacement
/// manager addition to run ahead of it.
fn preflight(planned: &[ChangeOperation]) -> Option<Vec<OperationRecord>> {
    let first = planned.iter().position(|op| op.destructive)?;
    if planned.iter().any(adds_manager) {
        return None;
    }
    Some(
        planned
            .iter()
            .enumerate()
            .map(|(index, op)| OperationRecord {
                index,
                operation: op.clone(),
                outcome: if op.destructive {
                    OperationOutcome::Rejected {
                        reason: "would leave the unit without a manager".into(),
                    }
                } else {
                    OperationOutcome::Skipped {
                        reason: format!("batch rejected at operation {first}"),
                    }
                },
                replayed: false,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, MemoryConnector};
    use crate::error::ErrorClass;
    use crate::ledger::MemoryLedger;
    use crate::types::{MemberId, Role, StateSnapshot};

    const UNIT: &str = "org/payments";

    fn engine(ledger: Arc<MemoryLedger>) -> ApplyEngine {
        ApplyEngine::new(ledger, Duration::from_secs(5))
    }

    fn connector() -> MemoryConnector {
        MemoryConnector::new("github")
            .with_unit(StateSnapshot::new("github", UNIT).with_manager("alice"))
    }

    fn three_additions() -> Vec<ChangeOperation> {
        ["bob", "carol", "dave"]
            .into_iter()
            .map(|m| ChangeOperation::add(MemberId::new(m), Role::new("member")))
            .collect()
    }

    #[tokio::test]
    async fn test_best_effort_keeps_going_after_permanent_failure() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        connector
            .fail_apply_on(
                "carol",
                ConnectorError::Invalid {
                    system: "github".into(),
                    message: "unknown user".into(),
                },
            )
            .await;

        let report = engine(ledger)
            .apply_all(&connector, &UnitRef::new(UNIT), three_additions(), "job-1:fp", None)
            .await
            .unwrap();

        assert_eq!(report.policy, PartialFailurePolicy::BestEffortContinue);
        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(report.records[0].outcome, OperationOutcome::Applied);
        assert!(matches!(
            report.records[1].outcome,
            OperationOutcome::Failed {
                class: ErrorClass::Permanent,
                ..
            }
        ));
        assert_eq!(report.records[2].outcome, OperationOutcome::Applied);
        assert_eq!(
            report.records[1].operation.idempotency_key.as_deref(),
            Some("job-1:fp:1")
        );
    }

    #[tokio::test]
    async fn test_abort_skips_the_rest() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        connector
            .fail_apply_on(
                "bob",
                ConnectorError::Forbidden {
                    system: "github".into(),
                    message: "no".into(),
                },
            )
            .await;

        let report = engine(ledger)
            .apply_all(
                &connector,
                &UnitRef::new(UNIT),
                three_additions(),
                "job-2:fp",
                Some(PartialFailurePolicy::AbortOnFirstFailure),
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(matches!(
            report.records[1].outcome,
            OperationOutcome::Skipped { .. }
        ));
        assert_eq!(connector.total_apply_calls().await, 1);
    }

    #[tokio::test]
    async fn test_destructive_batch_rejected_without_side_effects() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        let mut removal = ChangeOperation::remove(MemberId::new("alice"), Role::manager());
        removal.destructive = true;
        let ops = vec![
            removal,
            ChangeOperation::add(MemberId::new("bob"), Role::new("member")),
        ];

        let report = engine(ledger.clone())
            .apply_all(
                &connector,
                &UnitRef::new(UNIT),
                ops,
                "job-3:fp",
                Some(PartialFailurePolicy::BestEffortContinue),
            )
            .await
            .unwrap();

        assert_eq!(report.policy, PartialFailurePolicy::AbortOnFirstFailure);
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(matches!(
            report.records[0].outcome,
            OperationOutcome::Rejected { .. }
        ));
        assert_eq!(connector.total_apply_calls().await, 0);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_repeat_batch_replays_from_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        let engine = engine(ledger);
        let unit = UnitRef::new(UNIT);

        let first = engine
            .apply_all(&connector, &unit, three_additions(), "job-4:fp", None)
            .await
            .unwrap();
        let second = engine
            .apply_all(&connector, &unit, three_additions(), "job-4:fp", None)
            .await
            .unwrap();

        assert_eq!(first.outcome, RunOutcome::Applied);
        assert_eq!(second.outcome, RunOutcome::Applied);
        assert!(second.records.iter().all(|r| r.replayed));
        assert_eq!(connector.max_calls_per_key().await, 1);
        assert_eq!(connector.effects().await, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_releases_key_and_fails_step() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        connector
            .fail_apply_on(
                "bob",
                ConnectorError::RateLimited {
                    system: "github".into(),
                    retry_after_ms: Some(1000),
                },
            )
            .await;

        let err = engine(ledger.clone())
            .apply_all(&connector, &UnitRef::new(UNIT), three_additions(), "job-5:fp", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            ledger.record("job-5:fp:0", "anything").await.unwrap(),
            LedgerRecord::FirstTime
        );
    }

    fn manager_swap() -> Vec<ChangeOperation> {
        let mut removal = ChangeOperation::remove(MemberId::new("alice"), Role::manager());
        removal.destructive = true;
        vec![
            removal,
            ChangeOperation::add(MemberId::new("bob"), Role::manager()),
        ]
    }

    #[tokio::test]
    async fn test_manager_swap_adds_replacement_first() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();

        let report = engine(ledger)
            .apply_all(&connector, &UnitRef::new(UNIT), manager_swap(), "job-6:fp", None)
            .await
            .unwrap();

        assert_eq!(report.policy, PartialFailurePolicy::AbortOnFirstFailure);
        assert_eq!(report.outcome, RunOutcome::Applied);
        assert_eq!(
            report.records.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let state = connector.unit(&UnitRef::new(UNIT)).await.unwrap();
        assert_eq!(state.managers, vec![MemberId::new("bob")]);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_existing_manager() {
        let ledger = Arc::new(MemoryLedger::new());
        let connector = connector();
        connector
            .fail_apply_on(
                "bob",
                ConnectorError::Forbidden {
                    system: "github".into(),
                    message: "bob is not an org member".into(),
                },
            )
            .await;

        let report = engine(ledger)
            .apply_all(&connector, &UnitRef::new(UNIT), manager_swap(), "job-7:fp", None)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(matches!(
            report.records[0].outcome,
            OperationOutcome::Skipped { .. }
        ));
        assert!(matches!(
            report.records[1].outcome,
            OperationOutcome::Failed { .. }
        ));
        assert_eq!(connector.total_apply_calls().await, 1);
        let state = connector.unit(&UnitRef::new(UNIT)).await.unwrap();
        assert_eq!(state.managers, vec![MemberId::new("alice")]);
    }

    #[test]
    fn test_aggregate() {
        assert_eq!(aggregate(&[]), RunOutcome::NoOp);
    }
}

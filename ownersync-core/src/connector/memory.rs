//! In-memory connector.
//!
//! Holds unit state in a map, remembers every idempotency key it has seen,
//! and counts calls so tests can assert on externally visible effects.
//! Faults can be scripted per member (apply) or per connector (fetch).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Connector, ConnectorError};
use crate::types::{
    ChangeOperation, MemberId, OperationKind, OperationOutcome, Role, RoleAssignment,
    StateSnapshot, SystemRef, UnitRef,
};

#[derive(Default)]
struct MemoryState {
    units: HashMap<UnitRef, StateSnapshot>,
    seen_keys: HashSet<String>,
    apply_calls: HashMap<String, u32>,
    fetch_calls: u32,
    effects: u32,
    fetch_fault: Option<ConnectorError>,
    apply_faults: HashMap<MemberId, ConnectorError>,
}

pub struct MemoryConnector {
    system: SystemRef,
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    applies_in_flight: AtomicUsize,
    max_applies_in_flight: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: SystemRef::new(system),
            state: Mutex::new(MemoryState::default()),
            latency: None,
            applies_in_flight: AtomicUsize::new(0),
            max_applies_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_unit(mut self, snapshot: StateSnapshot) -> Self {
        let state = self.state.get_mut();
        state.units.insert(snapshot.unit_ref.clone(), snapshot);
        self
    }

    /// Delay every call by `latency` (exercises timeouts and overlap).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn set_unit(&self, snapshot: StateSnapshot) {
        let mut state = self.state.lock().await;
        state.units.insert(snapshot.unit_ref.clone(), snapshot);
    }

    pub async fn unit(&self, unit: &UnitRef) -> Option<StateSnapshot> {
        self.state.lock().await.units.get(unit).cloned()
    }

    /// Every subsequent `fetch` fails with `err`.
    pub async fn fail_fetch(&self, err: ConnectorError) {
        self.state.lock().await.fetch_fault = Some(err);
    }

    pub async fn clear_fetch_fault(&self) {
        self.state.lock().await.fetch_fault = None;
    }

    /// Every subsequent `apply` touching `member` fails with `err`.
    pub async fn fail_apply_on(&self, member: impl Into<String>, err: ConnectorError) {
        self.state
            .lock()
            .await
            .apply_faults
            .insert(MemberId::new(member), err);
    }

    pub async fn clear_apply_fault(&self, member: &str) {
        self.state
            .lock()
            .await
            .apply_faults
            .remove(&MemberId::new(member));
    }

    pub async fn apply_calls(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .apply_calls
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub async fn total_apply_calls(&self) -> u32 {
        self.state.lock().await.apply_calls.values().sum()
    }

    /// Highest number of calls per key observed for any key.
    pub async fn max_calls_per_key(&self) -> u32 {
        self.state
            .lock()
            .await
            .apply_calls
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub async fn fetch_calls(&self) -> u32 {
        self.state.lock().await.fetch_calls
    }

    /// Number of calls that actually changed state.
    pub async fn effects(&self) -> u32 {
        self.state.lock().await.effects
    }

    pub fn max_concurrent_applies(&self) -> usize {
        self.max_applies_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn err_not_found(&self, unit: &UnitRef) -> ConnectorError {
        ConnectorError::NotFound {
            system: self.system.to_string(),
            message: format!("unit '{unit}'"),
        }
    }
}

/// Mutate `snapshot` by `operation`. Returns whether anything changed.
fn mutate(snapshot: &mut StateSnapshot, operation: &ChangeOperation) -> bool {
    let member = &operation.member;
    let mut changed = false;
    if let Some(role) = &operation.before {
        changed |= remove_role(snapshot, member, role);
    }
    if let Some(role) = &operation.after {
        changed |= insert_role(snapshot, member, role);
    }
    changed
}

fn remove_role(snapshot: &mut StateSnapshot, member: &MemberId, role: &Role) -> bool {
    if role.is_manager() {
        let before = snapshot.managers.len();
        snapshot.managers.retain(|m| m != member);
        before != snapshot.managers.len()
    } else {
        snapshot.assignments.remove(&RoleAssignment {
            role: role.clone(),
            member: member.clone(),
        })
    }
}

fn insert_role(snapshot: &mut StateSnapshot, member: &MemberId, role: &Role) -> bool {
    if role.is_manager() {
        if snapshot.managers.contains(member) {
            return false;
        }
        snapshot.managers.push(member.clone());
        true
    } else {
        snapshot.assignments.insert(RoleAssignment {
            role: role.clone(),
            member: member.clone(),
        })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn system(&self) -> &SystemRef {
        &self.system
    }

    async fn fetch(&self, unit: &UnitRef) -> Result<StateSnapshot, ConnectorError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.fetch_calls += 1;
        if let Some(err) = &state.fetch_fault {
            return Err(err.clone());
        }
        let mut snapshot = state
            .units
            .get(unit)
            .cloned()
            .ok_or_else(|| self.err_not_found(unit))?;
        snapshot.fetched_at = Utc::now();
        Ok(snapshot)
    }

    async fn apply(
        &self,
        unit: &UnitRef,
        operation: &ChangeOperation,
        idempotency_key: &str,
    ) -> Result<OperationOutcome, ConnectorError> {
        let in_flight = self.applies_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_applies_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        self.simulate_latency().await;

        let result = {
            let mut state = self.state.lock().await;
            *state
                .apply_calls
                .entry(idempotency_key.to_string())
                .or_insert(0) += 1;

            if let Some(err) = state.apply_faults.get(&operation.member) {
                Err(err.clone())
            } else if state.seen_keys.contains(idempotency_key) {
                Ok(OperationOutcome::Unchanged)
            } else if operation.kind == OperationKind::UpdateRole && operation.before.is_none() {
                Err(ConnectorError::Invalid {
                    system: self.system.to_string(),
                    message: format!("update without a prior role for '{}'", operation.member),
                })
            } else {
                let state = &mut *state;
                match state.units.get_mut(unit) {
                    None => Err(self.err_not_found(unit)),
                    Some(snapshot) => {
                        let changed = mutate(snapshot, operation);
                        state.seen_keys.insert(idempotency_key.to_string());
                        if changed {
                            state.effects += 1;
                            Ok(OperationOutcome::Applied)
                        } else {
                            Ok(OperationOutcome::Unchanged)
                        }
                    }
                }
            }
        };

        self.applies_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> StateSnapshot {
        StateSnapshot::new("github", "org/payments").with_manager("alice")
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_per_key() {
        let connector = MemoryConnector::new("github").with_unit(team());
        let unit = UnitRef::new("org/payments");
        let op = ChangeOperation::add(MemberId::new("bob"), Role::new("member"));

        let first = connector.apply(&unit, &op, "k:0").await.unwrap();
        let second = connector.apply(&unit, &op, "k:0").await.unwrap();

        assert_eq!(first, OperationOutcome::Applied);
        assert_eq!(second, OperationOutcome::Unchanged);
        assert_eq!(connector.apply_calls("k:0").await, 2);
        assert_eq!(connector.effects().await, 1);
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let connector = MemoryConnector::new("github").with_unit(team());
        connector
            .fail_apply_on(
                "bob",
                ConnectorError::Forbidden {
                    system: "github".into(),
                    message: "outside collaborator".into(),
                },
            )
            .await;
        let op = ChangeOperation::add(MemberId::new("bob"), Role::new("member"));
        let err = connector
            .apply(&UnitRef::new("org/payments"), &op, "k:1")
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let missing = connector.fetch(&UnitRef::new("org/unknown")).await;
        assert!(matches!(missing, Err(ConnectorError::NotFound { .. })));
        assert_eq!(connector.fetch_calls().await, 1);
    }

    #[tokio::test]
    async fn test_update_role_moves_member() {
        let connector = MemoryConnector::new("github")
            .with_unit(team().with_assignment("member", "bob"));
        let unit = UnitRef::new("org/payments");
        let op = ChangeOperation::update(
            MemberId::new("bob"),
            Role::new("member"),
            Role::new("maintainer"),
        );
        connector.apply(&unit, &op, "k:2").await.unwrap();
        let state = connector.unit(&unit).await.unwrap();
        assert!(state
            .assignments
            .contains(&RoleAssignment::new("maintainer", "bob")));
        assert!(!state.assignments.contains(&RoleAssignment::new("member", "bob")));
    }
}

//! Core records shared across the engine.
//!
//! Cross-system links are plain identifiers. A unit never holds a live
//! handle to its source or target system; every lookup goes through a
//! connector call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{ErrorClass, ReconcileError, ReconcileResult};
use crate::workflow::Step;

// ─── Identifiers ──────────────────────────────────────────────

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Engine-side identifier of a reconciliation unit (e.g. `payments`).
    UnitId
);
string_id!(
    /// Identifier of a person or principal holding a role.
    MemberId
);
string_id!(
    /// Name of an external system; keys the connector registry.
    SystemRef
);
string_id!(
    /// Identifier of a unit inside one external system.
    UnitRef
);
string_id!(
    /// Role held by a member within a unit.
    Role
);

impl Role {
    pub const MANAGER: &'static str = "manager";

    pub fn manager() -> Self {
        Self::new(Self::MANAGER)
    }

    pub fn is_manager(&self) -> bool {
        self.0 == Self::MANAGER
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ─── Units and snapshots ──────────────────────────────────────

/// One `(role, member)` pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    pub member: MemberId,
}

impl RoleAssignment {
    pub fn new(role: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            role: Role::new(role),
            member: MemberId::new(member),
        }
    }
}

/// Where a unit lives in one external system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLocator {
    pub system: SystemRef,
    pub unit_ref: UnitRef,
}

impl UnitLocator {
    pub fn new(system: impl Into<String>, unit_ref: impl Into<String>) -> Self {
        Self {
            system: SystemRef::new(system),
            unit_ref: UnitRef::new(unit_ref),
        }
    }
}

/// An entity (e.g. a team) whose ownership must match across systems.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationUnit {
    pub id: UnitId,
    pub display_name: String,
    #[serde(default)]
    pub managers: Vec<MemberId>,
    #[serde(default)]
    pub assignments: BTreeSet<RoleAssignment>,
    pub source: UnitLocator,
    pub target: UnitLocator,
}

impl ReconciliationUnit {
    pub fn new(id: impl Into<String>, source: UnitLocator, target: UnitLocator) -> Self {
        let id = UnitId::new(id);
        Self {
            display_name: id.0.clone(),
            id,
            managers: Vec::new(),
            assignments: BTreeSet::new(),
            source,
            target,
        }
    }

    /// A managed unit has at least one manager and at most one role per member.
    pub fn validate(&self) -> ReconcileResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(ReconcileError::Validation("unit id must not be empty".into()));
        }
        if self.managers.is_empty() {
            return Err(ReconcileError::Validation(format!(
                "unit '{}' has no manager",
                self.id
            )));
        }
        check_unique_roles(&self.id.0, &self.assignments)
    }
}

fn check_unique_roles(scope: &str, assignments: &BTreeSet<RoleAssignment>) -> ReconcileResult<()> {
    let mut seen: BTreeMap<&MemberId, &Role> = BTreeMap::new();
    for a in assignments {
        if let Some(existing) = seen.insert(&a.member, &a.role) {
            return Err(ReconcileError::Validation(format!(
                "{scope}: member '{}' holds both '{}' and '{}'",
                a.member, existing, a.role
            )));
        }
    }
    Ok(())
}

/// Ownership state of one unit as read from one system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub system: SystemRef,
    pub unit_ref: UnitRef,
    pub managers: Vec<MemberId>,
    pub assignments: BTreeSet<RoleAssignment>,
    pub fetched_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn new(system: impl Into<String>, unit_ref: impl Into<String>) -> Self {
        Self {
            system: SystemRef::new(system),
            unit_ref: UnitRef::new(unit_ref),
            managers: Vec::new(),
            assignments: BTreeSet::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_manager(mut self, member: impl Into<String>) -> Self {
        let member = MemberId::new(member);
        if !self.managers.contains(&member) {
            self.managers.push(member);
        }
        self
    }

    pub fn with_assignment(mut self, role: impl Into<String>, member: impl Into<String>) -> Self {
        self.assignments.insert(RoleAssignment::new(role, member));
        self
    }

    /// Managers folded in as `(manager, member)` pairs.
    pub fn pairs(&self) -> BTreeSet<RoleAssignment> {
        let mut pairs = self.assignments.clone();
        for m in &self.managers {
            pairs.insert(RoleAssignment {
                role: Role::manager(),
                member: m.clone(),
            });
        }
        pairs
    }

    /// Stable digest of the ownership content (ignores `fetched_at` and manager order).
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        for p in self.pairs() {
            canonical.push_str(p.role.as_str());
            canonical.push('\u{1f}');
            canonical.push_str(p.member.as_str());
            canonical.push('\u{1e}');
        }
        sha256_hex(canonical.as_bytes())[..16].to_string()
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        let scope = format!("{}/{}", self.system, self.unit_ref);
        let mut managers = BTreeSet::new();
        for m in &self.managers {
            if !managers.insert(m) {
                return Err(ReconcileError::Validation(format!(
                    "{scope}: manager '{m}' listed twice"
                )));
            }
        }
        if self.assignments.iter().any(|a| a.role.is_manager()) {
            return Err(ReconcileError::Validation(format!(
                "{scope}: managers must be listed in the manager list, not as assignments"
            )));
        }
        check_unique_roles(&scope, &self.assignments)
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Whether a job may mutate the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Mutate,
    AuditOnly,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mutate => "mutate",
            Self::AuditOnly => "audit_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mutate" => Some(Self::Mutate),
            "audit_only" => Some(Self::AuditOnly),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::DeadLettered | Self::Cancelled
        )
    }
}

/// Where a job's idempotency key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOrigin {
    /// Supplied by the caller; authoritative.
    Explicit,
    /// Derived from the job's content.
    Derived,
}

impl KeyOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Derived => "derived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(Self::Explicit),
            "derived" => Some(Self::Derived),
            _ => None,
        }
    }
}

/// A unit of work on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub unit_id: UnitId,
    pub requester: String,
    pub idempotency_key: String,
    pub key_origin: KeyOrigin,
    pub mode: JobMode,
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// New pending job. An explicit key wins over the derived one.
    pub fn new(
        unit_id: UnitId,
        mode: JobMode,
        requester: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        let job_id = Uuid::now_v7();
        let (idempotency_key, key_origin) = match idempotency_key {
            Some(key) => (key, KeyOrigin::Explicit),
            None => (
                derive_idempotency_key(&unit_id, mode, job_id),
                KeyOrigin::Derived,
            ),
        };
        let now = Utc::now();
        Self {
            job_id,
            unit_id,
            requester: requester.into(),
            idempotency_key,
            key_origin,
            mode,
            attempts: 0,
            status: JobStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hash stored in the ledger next to the job key. Reusing a key for a
    /// different unit or mode is a conflict.
    pub fn payload_hash(&self) -> String {
        sha256_hex(format!("job\u{1f}{}\u{1f}{}", self.unit_id, self.mode).as_bytes())
    }
}

/// Content-derived idempotency key for jobs submitted without one.
pub fn derive_idempotency_key(unit_id: &UnitId, mode: JobMode, job_id: Uuid) -> String {
    sha256_hex(format!("{unit_id}\u{1f}{mode}\u{1f}{job_id}").as_bytes())
}

// ─── Change operations ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AddMember,
    RemoveMember,
    UpdateRole,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddMember => "add_member",
            Self::RemoveMember => "remove_member",
            Self::UpdateRole => "update_role",
        }
    }
}

/// One step transforming target state toward source state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOperation {
    pub kind: OperationKind,
    pub member: MemberId,
    /// Role held before the operation (`None` for additions).
    pub before: Option<Role>,
    /// Role held after the operation (`None` for removals).
    pub after: Option<Role>,
    /// Applying this would leave the unit without a manager.
    #[serde(default)]
    pub destructive: bool,
    /// Operation-scoped key, assigned when the operation is planned for apply.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl ChangeOperation {
    pub fn add(member: MemberId, role: Role) -> Self {
        Self {
            kind: OperationKind::AddMember,
            member,
            before: None,
            after: Some(role),
            destructive: false,
            idempotency_key: None,
        }
    }

    pub fn remove(member: MemberId, role: Role) -> Self {
        Self {
            kind: OperationKind::RemoveMember,
            member,
            before: Some(role),
            after: None,
            destructive: false,
            idempotency_key: None,
        }
    }

    pub fn update(member: MemberId, from: Role, to: Role) -> Self {
        Self {
            kind: OperationKind::UpdateRole,
            member,
            before: Some(from),
            after: Some(to),
            destructive: false,
            idempotency_key: None,
        }
    }

    /// Digest of what the operation does; excludes the key itself.
    pub fn payload_hash(&self) -> String {
        let role = |r: &Option<Role>| r.as_ref().map(|r| r.0.clone()).unwrap_or_default();
        sha256_hex(
            format!(
                "{}\u{1f}{}\u{1f}{}\u{1f}{}",
                self.kind.as_str(),
                self.member,
                role(&self.before),
                role(&self.after)
            )
            .as_bytes(),
        )
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.before, &self.after) {
            (None, Some(to)) => write!(f, "add({}, {})", self.member, to),
            (Some(from), None) => write!(f, "remove({}, {})", self.member, from),
            (Some(from), Some(to)) => write!(f, "update({}, {} -> {})", self.member, from, to),
            (None, None) => write!(f, "{}({})", self.kind.as_str(), self.member),
        }
    }
}

/// Result of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The connector changed the target.
    Applied,
    /// The target already matched; nothing changed.
    Unchanged,
    Failed { class: ErrorClass, message: String },
    /// Refused by the pre-flight guard.
    Rejected { reason: String },
    /// Not attempted because an earlier operation aborted the batch.
    Skipped { reason: String },
    /// Audit mode: the operation is needed but was not applied.
    Drift,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }
}

/// An operation together with what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub index: usize,
    pub operation: ChangeOperation,
    pub outcome: OperationOutcome,
    /// Outcome came from the ledger rather than a connector call.
    #[serde(default)]
    pub replayed: bool,
}

// ─── Runs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NoOp,
    Applied,
    PartialFailure,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::Applied => "applied",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable record of one executed workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub unit_id: UnitId,
    pub mode: JobMode,
    /// The job's idempotency key; ties redeliveries and replays together.
    pub correlation_id: String,
    pub source_before: Option<StateSnapshot>,
    pub target_before: Option<StateSnapshot>,
    /// Target state implied by the successful operations.
    pub target_after: Option<StateSnapshot>,
    pub operations: Vec<OperationRecord>,
    pub outcome: RunOutcome,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub cancelled: bool,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Run {
    /// An audit run that found the target out of line with the source.
    pub fn drift_detected(&self) -> bool {
        self.mode == JobMode::AuditOnly && !self.operations.is_empty()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            job_id: self.job_id,
            unit_id: self.unit_id.clone(),
            mode: self.mode,
            outcome: self.outcome,
            operations: self.operations.len(),
            failed_operations: self
                .operations
                .iter()
                .filter(|r| matches!(r.outcome, OperationOutcome::Failed { .. }))
                .count(),
            drift: self.drift_detected(),
            failure: self.failure.clone(),
        }
    }
}

/// What the notifier receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub unit_id: UnitId,
    pub mode: JobMode,
    pub outcome: RunOutcome,
    pub operations: usize,
    pub failed_operations: usize,
    pub drift: bool,
    pub failure: Option<String>,
}

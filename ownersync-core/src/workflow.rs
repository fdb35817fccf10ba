//! Workflow graph.
//!
//! One job runs through a fixed set of steps:
//!
//! ```text
//! FETCH_SOURCE ─┐
//!               ├─► DIFF ─┬─ empty ──────────────► RECORD_NOOP ───┐
//! FETCH_TARGET ─┘         └─ ops ─► APPLY ─► RECORD_RESULT ───────┴─► NOTIFY
//! ```
//!
//! The two fetches run concurrently. Audit jobs go from DIFF straight to
//! RECORD_RESULT with every operation marked as drift. A job cancelled
//! before it was claimed goes straight to RECORD_NOOP.
//!
//! Steps hand data forward through [`StepOutput`]; a step can only read the
//! outputs of the steps it declares in [`Step::predecessors`].
//!
//! Mutate jobs hold the unit lease from FETCH_TARGET through APPLY, so two
//! mutate jobs for one unit never interleave. The lease is released on
//! every exit path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::apply::{ApplyEngine, ApplyReport};
use crate::audit::AuditStore;
use crate::catalog::UnitCatalog;
use crate::config::WorkflowConfig;
use crate::connector::{with_call_timeout, Connector, ConnectorRegistry};
use crate::diff;
use crate::error::{ErrorClass, ReconcileError, ReconcileResult};
use crate::ledger::{
    cancel_mark, job_lease_name, unit_lease_name, IdempotencyLedger, LedgerRecord, StoredRun,
};
use crate::notify::{notify_best_effort, Notifier};
use crate::types::{
    ChangeOperation, Job, JobMode, OperationOutcome, OperationRecord, ReconciliationUnit, Run,
    RunOutcome, StateSnapshot, UnitId, UnitRef,
};

// ─── Steps ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    FetchSource,
    FetchTarget,
    Diff,
    Apply,
    RecordNoop,
    RecordResult,
    Notify,
}

impl Step {
    /// Every step, in an order consistent with [`Step::predecessors`].
    pub const ALL: [Step; 7] = [
        Step::FetchSource,
        Step::FetchTarget,
        Step::Diff,
        Step::Apply,
        Step::RecordNoop,
        Step::RecordResult,
        Step::Notify,
    ];

    /// Steps whose output this step may read.
    pub fn predecessors(&self) -> &'static [Step] {
        match self {
            Step::FetchSource | Step::FetchTarget => &[],
            Step::Diff => &[Step::FetchSource, Step::FetchTarget],
            Step::Apply => &[Step::Diff],
            Step::RecordNoop => &[Step::Diff],
            // Audit jobs skip APPLY.
            Step::RecordResult => &[Step::Diff, Step::Apply],
            Step::Notify => &[Step::RecordNoop, Step::RecordResult],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchSource => "FETCH_SOURCE",
            Step::FetchTarget => "FETCH_TARGET",
            Step::Diff => "DIFF",
            Step::Apply => "APPLY",
            Step::RecordNoop => "RECORD_NOOP",
            Step::RecordResult => "RECORD_RESULT",
            Step::Notify => "NOTIFY",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step produced.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// FETCH_SOURCE, FETCH_TARGET
    Snapshot(StateSnapshot),
    /// DIFF carries the snapshots forward so the record steps see them.
    Diff {
        source: StateSnapshot,
        target: StateSnapshot,
        operations: Vec<ChangeOperation>,
    },
    Applied(ApplyReport),
    Recorded(Run),
}

impl StepOutput {
    fn kind(&self) -> &'static str {
        match self {
            StepOutput::Snapshot(_) => "snapshot",
            StepOutput::Diff { .. } => "diff",
            StepOutput::Applied(_) => "applied",
            StepOutput::Recorded(_) => "recorded",
        }
    }
}

/// Outputs of completed steps plus the order they completed in.
#[derive(Debug, Default)]
struct StepOutputs {
    by_step: BTreeMap<Step, StepOutput>,
    trail: Vec<Step>,
}

impl StepOutputs {
    fn put(&mut self, step: Step, output: StepOutput) {
        self.trail.push(step);
        self.by_step.insert(step, output);
    }

    fn peek(&self, consumer: Step, producer: Step) -> ReconcileResult<&StepOutput> {
        check_dependency(consumer, producer)?;
        self.by_step
            .get(&producer)
            .ok_or_else(|| missing(consumer, producer))
    }

    fn take(&mut self, consumer: Step, producer: Step) -> ReconcileResult<StepOutput> {
        check_dependency(consumer, producer)?;
        self.by_step
            .remove(&producer)
            .ok_or_else(|| missing(consumer, producer))
    }

    fn take_optional(&mut self, consumer: Step, producer: Step) -> ReconcileResult<Option<StepOutput>> {
        if self.by_step.contains_key(&producer) {
            self.take(consumer, producer).map(Some)
        } else {
            Ok(None)
        }
    }

    /// First available output among the consumer's predecessors.
    fn take_any(&mut self, consumer: Step) -> ReconcileResult<StepOutput> {
        for producer in consumer.predecessors() {
            if let Some(output) = self.take_optional(consumer, *producer)? {
                return Ok(output);
            }
        }
        Err(ReconcileError::Permanent(format!(
            "{consumer}: no predecessor produced output"
        )))
    }

    fn take_snapshot(&mut self, consumer: Step, producer: Step) -> ReconcileResult<StateSnapshot> {
        match self.take(consumer, producer)? {
            StepOutput::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected(consumer, producer, &other)),
        }
    }
}

fn check_dependency(consumer: Step, producer: Step) -> ReconcileResult<()> {
    if consumer.predecessors().contains(&producer) {
        Ok(())
    } else {
        Err(ReconcileError::Permanent(format!(
            "{consumer} does not depend on {producer}"
        )))
    }
}

fn missing(consumer: Step, producer: Step) -> ReconcileError {
    ReconcileError::Permanent(format!("{consumer}: {producer} produced no output"))
}

fn unexpected(consumer: Step, producer: Step, output: &StepOutput) -> ReconcileError {
    ReconcileError::Permanent(format!(
        "{consumer}: unexpected {} output from {producer}",
        output.kind()
    ))
}

// ─── Outcome ──────────────────────────────────────────────────

/// Terminal result of [`WorkflowGraph::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    /// The steps ran and produced a new run.
    Completed(Run),
    /// The job key had already produced a run; nothing was executed.
    Replayed(Run),
}

impl WorkflowOutcome {
    pub fn run(&self) -> &Run {
        match self {
            WorkflowOutcome::Completed(run) | WorkflowOutcome::Replayed(run) => run,
        }
    }

    pub fn into_run(self) -> Run {
        match self {
            WorkflowOutcome::Completed(run) | WorkflowOutcome::Replayed(run) => run,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, WorkflowOutcome::Replayed(_))
    }
}

/// Fields of a run that depend on how far the steps got.
#[derive(Default)]
struct RunDraft {
    source_before: Option<StateSnapshot>,
    target_before: Option<StateSnapshot>,
    target_after: Option<StateSnapshot>,
    operations: Vec<OperationRecord>,
    outcome: Option<RunOutcome>,
    cancelled: bool,
    failure: Option<String>,
}

impl RunDraft {
    fn into_run(self, job: &Job, started_at: DateTime<Utc>, steps: Vec<Step>) -> Run {
        Run {
            run_id: uuid::Uuid::now_v7(),
            job_id: job.job_id,
            unit_id: job.unit_id.clone(),
            mode: job.mode,
            correlation_id: job.idempotency_key.clone(),
            source_before: self.source_before,
            target_before: self.target_before,
            target_after: self.target_after,
            operations: self.operations,
            outcome: self.outcome.unwrap_or(RunOutcome::NoOp),
            steps,
            cancelled: self.cancelled,
            failure: self.failure,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

// ─── Graph ────────────────────────────────────────────────────

/// Executes jobs. Shared by all workers; holds no per-job state.
pub struct WorkflowGraph {
    catalog: Arc<UnitCatalog>,
    connectors: ConnectorRegistry,
    ledger: Arc<dyn IdempotencyLedger>,
    audit: Arc<dyn AuditStore>,
    notifier: Arc<dyn Notifier>,
    apply: ApplyEngine,
    config: WorkflowConfig,
}

impl WorkflowGraph {
    pub fn new(
        catalog: Arc<UnitCatalog>,
        connectors: ConnectorRegistry,
        ledger: Arc<dyn IdempotencyLedger>,
        audit: Arc<dyn AuditStore>,
        notifier: Arc<dyn Notifier>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            apply: ApplyEngine::new(ledger.clone(), config.call_timeout()),
            catalog,
            connectors,
            ledger,
            audit,
            notifier,
            config,
        }
    }

    pub fn catalog(&self) -> &UnitCatalog {
        &self.catalog
    }

    /// Run `job` to a terminal state. Errors carry the retry class of the
    /// step that failed.
    pub async fn execute(&self, job: &Job) -> ReconcileResult<WorkflowOutcome> {
        let span = tracing::info_span!(
            "reconcile_job",
            job_id = %job.job_id,
            unit_id = %job.unit_id,
            mode = %job.mode,
            attempt = job.attempts,
        );
        self.execute_guarded(job).instrument(span).await
    }

    async fn execute_guarded(&self, job: &Job) -> ReconcileResult<WorkflowOutcome> {
        let unit = self.catalog.get(&job.unit_id)?;
        let holder = job.job_id.to_string();

        // One job per key at a time. A redelivery of the same job re-enters.
        let job_lease = job_lease_name(&job.idempotency_key);
        if !self
            .ledger
            .acquire_lease(&job_lease, &holder, self.config.job_budget())
            .await?
        {
            return Err(ReconcileError::Transient(format!(
                "another job with key '{}' is in progress",
                job.idempotency_key
            )));
        }

        let result = match tokio::time::timeout(
            self.config.job_budget(),
            self.execute_deduplicated(job, unit, &holder),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Transient(format!(
                "job budget of {}ms exhausted",
                self.config.job_budget_ms
            ))),
        };

        if job.mode == JobMode::Mutate {
            self.release_lease(&unit_lease_name(&unit.id), &holder).await;
        }
        self.release_lease(&job_lease, &holder).await;

        if let Err(e) = &result {
            match e.class() {
                ErrorClass::Conflict => {
                    error!(key = %job.idempotency_key, error = %e, "Idempotency key conflict");
                }
                _ => {
                    // Redelivery or resubmission starts fresh.
                    if let Err(release_err) = self.ledger.release(&job.idempotency_key).await {
                        warn!(error = %release_err, "Failed to release job key");
                    }
                }
            }
        }
        result
    }

    async fn execute_deduplicated(
        &self,
        job: &Job,
        unit: &ReconciliationUnit,
        holder: &str,
    ) -> ReconcileResult<WorkflowOutcome> {
        match self
            .ledger
            .record(&job.idempotency_key, &job.payload_hash())
            .await?
        {
            LedgerRecord::Duplicate {
                stored: Some(stored),
            } => return self.replay(stored).await.map(WorkflowOutcome::Replayed),
            LedgerRecord::Duplicate { stored: None } => {
                warn!(key = %job.idempotency_key, "Resuming job key left in flight by an earlier attempt");
            }
            LedgerRecord::FirstTime => {}
        }

        self.run_steps(job, unit, holder)
            .await
            .map(WorkflowOutcome::Completed)
    }

    async fn replay(&self, stored: serde_json::Value) -> ReconcileResult<Run> {
        let stored: StoredRun = serde_json::from_value(stored)
            .map_err(|e| anyhow::anyhow!("corrupt job ledger entry: {e}"))?;
        let run = self
            .audit
            .get_run(stored.run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run {} missing from audit store", stored.run_id))?;
        info!(run_id = %run.run_id, outcome = %run.outcome, "Duplicate job; replaying recorded run");
        Ok(run)
    }

    async fn run_steps(
        &self,
        job: &Job,
        unit: &ReconciliationUnit,
        holder: &str,
    ) -> ReconcileResult<Run> {
        let started_at = Utc::now();
        let mut outputs = StepOutputs::default();

        if self.ledger.is_cancelled(&cancel_mark(job.job_id)).await? {
            info!("Job cancelled before execution; recording no-op");
            let draft = RunDraft {
                cancelled: true,
                ..Default::default()
            };
            self.record(Step::RecordNoop, job, started_at, &mut outputs, draft)
                .await?;
            return self.notify(&mut outputs).await;
        }

        let source_connector = self.connectors.get(&unit.source.system)?;
        let target_connector = self.connectors.get(&unit.target.system)?;

        // ── FETCH_SOURCE ‖ FETCH_TARGET ──
        let (source, target) = tokio::try_join!(
            self.fetch(Step::FetchSource, &*source_connector, &unit.source.unit_ref),
            async {
                if job.mode == JobMode::Mutate {
                    self.acquire_unit_lease(&unit.id, holder).await?;
                }
                self.fetch(Step::FetchTarget, &*target_connector, &unit.target.unit_ref)
                    .await
            }
        )?;
        outputs.put(Step::FetchSource, StepOutput::Snapshot(source));
        outputs.put(Step::FetchTarget, StepOutput::Snapshot(target));

        // ── DIFF ──
        let source = outputs.take_snapshot(Step::Diff, Step::FetchSource)?;
        let target = outputs.take_snapshot(Step::Diff, Step::FetchTarget)?;
        let operations = diff::compute_with(&source, &target, self.config.diff_options());
        debug!(operations = operations.len(), "Diff computed");
        let converged = operations.is_empty();
        outputs.put(
            Step::Diff,
            StepOutput::Diff {
                source,
                target,
                operations,
            },
        );

        if converged {
            let draft = self.noop_draft(&mut outputs)?;
            self.release_lease(&unit_lease_name(&unit.id), holder).await;
            self.record(Step::RecordNoop, job, started_at, &mut outputs, draft)
                .await?;
            return self.notify(&mut outputs).await;
        }

        // ── APPLY ──
        if job.mode == JobMode::Mutate {
            let report = self
                .apply_step(job, unit, &*target_connector, &outputs)
                .await
                .map_err(|e| step_failed(Step::Apply, e))?;
            self.release_lease(&unit_lease_name(&unit.id), holder).await;
            outputs.put(Step::Apply, StepOutput::Applied(report));
        }

        // ── RECORD_RESULT ──
        let draft = self.result_draft(&mut outputs)?;
        self.record(Step::RecordResult, job, started_at, &mut outputs, draft)
            .await?;
        self.notify(&mut outputs).await
    }

    async fn fetch(
        &self,
        step: Step,
        connector: &dyn Connector,
        unit_ref: &UnitRef,
    ) -> ReconcileResult<StateSnapshot> {
        let snapshot = with_call_timeout(
            connector.system(),
            self.config.call_timeout(),
            connector.fetch(unit_ref),
        )
        .await
        .map_err(|e| step_failed(step, e.into()))?;

        snapshot.validate().map_err(|e| {
            step_failed(
                step,
                ReconcileError::Permanent(format!("invalid snapshot: {e}")),
            )
        })?;
        Ok(snapshot)
    }

    /// Poll the unit lease until it is ours. Bounded by the job budget.
    async fn acquire_unit_lease(&self, unit_id: &UnitId, holder: &str) -> ReconcileResult<()> {
        let name = unit_lease_name(unit_id);
        let mut waited = false;
        loop {
            if self
                .ledger
                .acquire_lease(&name, holder, self.config.job_budget())
                .await?
            {
                if waited {
                    debug!(lease = %name, "Unit lease acquired after waiting");
                }
                return Ok(());
            }
            waited = true;
            tokio::time::sleep(self.config.lease_poll_interval()).await;
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) {
        if let Err(e) = self.ledger.release_lease(name, holder).await {
            warn!(lease = %name, error = %e, "Failed to release lease; it will expire");
        }
    }

    async fn apply_step(
        &self,
        job: &Job,
        unit: &ReconciliationUnit,
        connector: &dyn Connector,
        outputs: &StepOutputs,
    ) -> ReconcileResult<ApplyReport> {
        let (target, operations) = match outputs.peek(Step::Apply, Step::Diff)? {
            StepOutput::Diff {
                target, operations, ..
            } => (target, operations.clone()),
            other => return Err(unexpected(Step::Apply, Step::Diff, other)),
        };

        let base_key = format!("{}:{}", job.idempotency_key, target.fingerprint());
        let report = self
            .apply
            .apply_all(
                connector,
                &unit.target.unit_ref,
                operations,
                &base_key,
                self.config.partial_failure_policy,
            )
            .await?;
        info!(
            outcome = %report.outcome,
            operations = report.records.len(),
            replayed = report.records.iter().filter(|r| r.replayed).count(),
            "Operations applied"
        );
        Ok(report)
    }

    fn noop_draft(&self, outputs: &mut StepOutputs) -> ReconcileResult<RunDraft> {
        match outputs.take(Step::RecordNoop, Step::Diff)? {
            StepOutput::Diff { source, target, .. } => Ok(RunDraft {
                source_before: Some(source),
                target_after: Some(target.clone()),
                target_before: Some(target),
                outcome: Some(RunOutcome::NoOp),
                ..Default::default()
            }),
            other => Err(unexpected(Step::RecordNoop, Step::Diff, &other)),
        }
    }

    fn result_draft(&self, outputs: &mut StepOutputs) -> ReconcileResult<RunDraft> {
        let (source, target, operations) = match outputs.take(Step::RecordResult, Step::Diff)? {
            StepOutput::Diff {
                source,
                target,
                operations,
            } => (source, target, operations),
            other => return Err(unexpected(Step::RecordResult, Step::Diff, &other)),
        };

        match outputs.take_optional(Step::RecordResult, Step::Apply)? {
            Some(StepOutput::Applied(report)) => {
                let after = diff::converge(&target, &report.successful_operations());
                Ok(RunDraft {
                    source_before: Some(source),
                    target_before: Some(target),
                    target_after: Some(after),
                    outcome: Some(report.outcome),
                    operations: report.records,
                    ..Default::default()
                })
            }
            Some(other) => Err(unexpected(Step::RecordResult, Step::Apply, &other)),
            None => {
                // Audit: report what would change, touch nothing.
                info!(operations = operations.len(), "Drift detected");
                let records = operations
                    .into_iter()
                    .enumerate()
                    .map(|(index, operation)| OperationRecord {
                        index,
                        operation,
                        outcome: OperationOutcome::Drift,
                        replayed: false,
                    })
                    .collect();
                Ok(RunDraft {
                    source_before: Some(source),
                    target_after: Some(target.clone()),
                    target_before: Some(target),
                    operations: records,
                    outcome: Some(RunOutcome::NoOp),
                    ..Default::default()
                })
            }
        }
    }

    /// Write the run (once) and then mark the job key complete.
    async fn record(
        &self,
        step: Step,
        job: &Job,
        started_at: DateTime<Utc>,
        outputs: &mut StepOutputs,
        draft: RunDraft,
    ) -> ReconcileResult<()> {
        let mut steps = outputs.trail.clone();
        steps.push(step);
        let run = draft.into_run(job, started_at, steps);

        self.persist(job, &run)
            .await
            .map_err(|e| step_failed(step, e))?;
        info!(
            run_id = %run.run_id,
            outcome = %run.outcome,
            operations = run.operations.len(),
            cancelled = run.cancelled,
            "Run recorded"
        );
        outputs.put(step, StepOutput::Recorded(run));
        Ok(())
    }

    async fn persist(&self, job: &Job, run: &Run) -> ReconcileResult<()> {
        self.audit.put_run(run).await?;
        let stored = serde_json::to_value(StoredRun {
            run_id: run.run_id,
            outcome: run.outcome,
        })
        .map_err(anyhow::Error::from)?;
        self.ledger.complete(&job.idempotency_key, &stored).await?;
        Ok(())
    }

    async fn notify(&self, outputs: &mut StepOutputs) -> ReconcileResult<Run> {
        match outputs.take_any(Step::Notify)? {
            StepOutput::Recorded(run) => {
                notify_best_effort(&*self.notifier, &run.summary()).await;
                Ok(run)
            }
            other => Err(ReconcileError::Permanent(format!(
                "NOTIFY: unexpected {} output",
                other.kind()
            ))),
        }
    }

    /// Record a terminal failure run for a job that will not be retried.
    /// The job key stays free so the caller can resubmit.
    pub async fn record_failure(&self, job: &Job, failure: &ReconcileError) -> ReconcileResult<Run> {
        let draft = RunDraft {
            outcome: Some(RunOutcome::Failed),
            failure: Some(format!("{}: {failure}", failure.class())),
            ..Default::default()
        };
        let run = draft.into_run(job, Utc::now(), vec![Step::RecordResult]);
        self.audit.put_run(&run).await?;
        error!(
            job_id = %job.job_id,
            unit_id = %job.unit_id,
            run_id = %run.run_id,
            error = %failure,
            "Job failed; failure run recorded"
        );
        notify_best_effort(&*self.notifier, &run.summary()).await;
        Ok(run)
    }
}

fn step_failed(step: Step, error: ReconcileError) -> ReconcileError {
    warn!(step = step.as_str(), class = %error.class(), error = %error, "Workflow step failed");
    error
}

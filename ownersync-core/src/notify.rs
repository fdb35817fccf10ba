//! Run notifications (best-effort).

use async_trait::async_trait;

use crate::types::{RunOutcome, RunSummary};

/// Receives a summary of every recorded run. Implemented outside the crate
/// (chat, email, ticketing); failures never fail the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Writes summaries to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        match summary.outcome {
            RunOutcome::Failed | RunOutcome::PartialFailure => tracing::warn!(
                run_id = %summary.run_id,
                unit_id = %summary.unit_id,
                outcome = %summary.outcome,
                failed_operations = summary.failed_operations,
                failure = summary.failure.as_deref().unwrap_or(""),
                "Reconciliation run needs attention"
            ),
            _ => tracing::info!(
                run_id = %summary.run_id,
                unit_id = %summary.unit_id,
                mode = %summary.mode,
                outcome = %summary.outcome,
                operations = summary.operations,
                drift = summary.drift,
                "Reconciliation run recorded"
            ),
        }
        Ok(())
    }
}

/// Deliver `summary`, logging and swallowing any error.
pub async fn notify_best_effort(notifier: &dyn Notifier, summary: &RunSummary) {
    if let Err(e) = notifier.notify(summary).await {
        tracing::warn!(
            run_id = %summary.run_id,
            error = %e,
            "Run notification failed (non-fatal)"
        );
    }
}

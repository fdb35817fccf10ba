//! Engine configuration.
//!
//! Loaded from YAML. Every section has defaults, so a file only needs the
//! `units` list (and whatever it wants to override).
//!
//! ```yaml
//! dispatcher:
//!   workers: 4
//!   max_attempts: 5
//! workflow:
//!   call_timeout_ms: 5000
//! scheduler:
//!   interval_secs: 900
//! units:
//!   - id: payments
//!     display_name: Payments
//!     managers: [alice]
//!     source: { system: directory, unit_ref: payments }
//!     target: { system: github, unit_ref: org/payments }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::apply::PartialFailurePolicy;
use crate::diff::DiffOptions;
use crate::types::ReconciliationUnit;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub workflow: WorkflowConfig,
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
    /// Units tracked by the catalog.
    pub units: Vec<ReconciliationUnit>,
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_unit(mut self, unit: ReconciliationUnit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.dispatcher.workers = workers;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.dispatcher.max_attempts = max_attempts;
        self
    }

    pub fn scheduler_enabled(mut self, enabled: bool) -> Self {
        self.scheduler.enabled = enabled;
        self
    }
}

/// Queue and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of independent workers.
    pub workers: usize,
    /// How long a delivered job stays invisible to other workers. Must exceed
    /// `workflow.job_budget_ms`.
    pub visibility_timeout_ms: u64,
    /// How long `receive` blocks waiting for a job.
    pub poll_timeout_ms: u64,
    /// Deliveries of one job allowed before it is dead-lettered, counting
    /// redeliveries after an expired visibility window.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Randomize backoff delays.
    pub jitter: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_timeout_ms: 300_000,
            poll_timeout_ms: 1_000,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            jitter: true,
        }
    }
}

impl DispatcherConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Per-job execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Bound on any single connector call.
    pub call_timeout_ms: u64,
    /// Wall-clock budget for one job execution; also the lease TTL.
    pub job_budget_ms: u64,
    /// How often a mutate job re-checks a busy unit lease.
    pub lease_poll_interval_ms: u64,
    /// Emit `update_role` instead of remove + add for simple role swaps.
    pub collapse_role_changes: bool,
    /// Policy for non-destructive batches; `None` means best-effort.
    pub partial_failure_policy: Option<PartialFailurePolicy>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            job_budget_ms: 120_000,
            lease_poll_interval_ms: 200,
            collapse_role_changes: false,
            partial_failure_policy: None,
        }
    }
}

impl WorkflowConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn job_budget(&self) -> Duration {
        Duration::from_millis(self.job_budget_ms)
    }

    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_interval_ms)
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            collapse_role_changes: self.collapse_role_changes,
        }
    }
}

/// Periodic audit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long completed entries are kept before collection.
    pub retention_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 3_600,
        }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
dispatcher:
  workers: 2
  max_attempts: 3
workflow:
  call_timeout_ms: 500
  partial_failure_policy: abort_on_first_failure
units:
  - id: payments
    display_name: Payments
    managers: [alice]
    source: { system: directory, unit_ref: payments }
    target: { system: github, unit_ref: org/payments }
"#;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.dispatcher.max_attempts, 5);
        assert!(config.scheduler.enabled);
        assert_eq!(config.workflow.call_timeout(), Duration::from_secs(10));
        assert!(config.units.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.dispatcher.workers, 2);
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert_eq!(config.dispatcher.poll_timeout_ms, 1_000);
        assert_eq!(config.workflow.call_timeout_ms, 500);
        assert_eq!(
            config.workflow.partial_failure_policy,
            Some(PartialFailurePolicy::AbortOnFirstFailure)
        );
        assert_eq!(config.units.len(), 1);
        assert_eq!(config.units[0].target.unit_ref.as_str(), "org/payments");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.units[0].managers[0].as_str(), "alice");

        let missing = EngineConfig::load_from_file(Path::new("/nonexistent/ownersync.yaml"));
        assert!(format!("{:#}", missing.unwrap_err()).contains("Reading"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::default()
            .workers(8)
            .max_attempts(2)
            .scheduler_enabled(false);
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.dispatcher.max_attempts, 2);
        assert!(!config.scheduler.enabled);
    }
}

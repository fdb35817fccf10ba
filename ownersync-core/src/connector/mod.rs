//! Connector capability interface.
//!
//! A connector reads and writes ownership state in one external system.
//! Concrete network adapters live outside this crate; they implement
//! [`Connector`] and are registered in a [`ConnectorRegistry`] under their
//! [`SystemRef`].

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorClass, ReconcileError, ReconcileResult};
use crate::types::{ChangeOperation, OperationOutcome, StateSnapshot, SystemRef, UnitRef};

pub use memory::MemoryConnector;

/// Connector failure, classified for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    // Transient
    #[error("{system}: call timed out after {timeout_ms}ms")]
    Timeout { system: String, timeout_ms: u64 },

    #[error("{system}: unavailable (status {status:?}): {message}")]
    Unavailable {
        system: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{system}: rate limited")]
    RateLimited {
        system: String,
        retry_after_ms: Option<u64>,
    },

    // Permanent
    #[error("{system}: invalid request: {message}")]
    Invalid { system: String, message: String },

    #[error("{system}: not found: {message}")]
    NotFound { system: String, message: String },

    #[error("{system}: forbidden: {message}")]
    Forbidden { system: String, message: String },

    #[error("{system}: schema mismatch: {message}")]
    SchemaMismatch { system: String, message: String },
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { .. } | Self::RateLimited { .. }
        )
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    /// Classify an HTTP-style status code returned by a remote API.
    pub fn from_status(system: &str, status: u16, message: impl Into<String>) -> Self {
        let system = system.to_string();
        let message = message.into();
        match status {
            401 | 403 => Self::Forbidden { system, message },
            404 | 410 => Self::NotFound { system, message },
            408 => Self::Timeout {
                system,
                timeout_ms: 0,
            },
            422 => Self::SchemaMismatch { system, message },
            429 => Self::RateLimited {
                system,
                retry_after_ms: None,
            },
            s if s >= 500 => Self::Unavailable {
                system,
                status: Some(s),
                message,
            },
            _ => Self::Invalid { system, message },
        }
    }
}

/// Read/write access to one external system.
#[async_trait]
pub trait Connector: Send + Sync {
    fn system(&self) -> &SystemRef;

    /// Read current ownership state. Side-effect free and safe to repeat.
    async fn fetch(&self, unit: &UnitRef) -> Result<StateSnapshot, ConnectorError>;

    /// Apply one operation. Must be safe to invoke more than once with the
    /// same `idempotency_key`; a repeat returns `Unchanged` without a second
    /// effect.
    async fn apply(
        &self,
        unit: &UnitRef,
        operation: &ChangeOperation,
        idempotency_key: &str,
    ) -> Result<OperationOutcome, ConnectorError>;
}

/// Bound a connector call; expiry classifies as [`ConnectorError::Timeout`].
pub async fn with_call_timeout<T, F>(
    system: &SystemRef,
    timeout: Duration,
    call: F,
) -> Result<T, ConnectorError>
where
    F: Future<Output = Result<T, ConnectorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout {
            system: system.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Connectors keyed by the system they serve.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    by_system: HashMap<SystemRef, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) -> &mut Self {
        self.by_system.insert(connector.system().clone(), connector);
        self
    }

    pub fn with(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    /// A unit pointing at an unregistered system is a configuration fault.
    pub fn get(&self, system: &SystemRef) -> ReconcileResult<Arc<dyn Connector>> {
        self.by_system.get(system).cloned().ok_or_else(|| {
            ReconcileError::Permanent(format!("no connector registered for system '{system}'"))
        })
    }

    pub fn systems(&self) -> Vec<&SystemRef> {
        let mut systems: Vec<_> = self.by_system.keys().collect();
        systems.sort();
        systems
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("systems", &self.systems())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ConnectorError::from_status("gh", 503, "down").is_transient());
        assert!(ConnectorError::from_status("gh", 429, "slow down").is_transient());
        assert!(ConnectorError::from_status("gh", 408, "timeout").is_transient());
        assert!(!ConnectorError::from_status("gh", 403, "nope").is_transient());
        assert!(!ConnectorError::from_status("gh", 404, "gone").is_transient());
        assert_eq!(
            ConnectorError::from_status("gh", 422, "bad field").class(),
            ErrorClass::Permanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient() {
        let system = SystemRef::new("slow");
        let result: Result<(), _> = with_call_timeout(&system, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ConnectorError::Timeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ConnectorRegistry::new()
            .with(Arc::new(MemoryConnector::new("directory")))
            .with(Arc::new(MemoryConnector::new("github")));
        assert!(registry.get(&SystemRef::new("github")).is_ok());
        let missing = registry.get(&SystemRef::new("jira")).err().unwrap();
        assert_eq!(missing.class(), ErrorClass::Permanent);
        assert_eq!(registry.systems().len(), 2);
    }
}

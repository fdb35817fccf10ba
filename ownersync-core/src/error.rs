//! Error taxonomy for the reconciliation engine.
//!
//! Every failure surfaced by a workflow step maps to exactly one
//! [`ErrorClass`]. The class alone decides what the dispatcher does with the
//! job:
//!
//! ```text
//! Validation → fail immediately, never retried
//! Transient  → retry with backoff, dead-letter after the attempt cap
//! Permanent  → fail, record a failed Run, alert the operator
//! Conflict   → fail loudly (integration bug), never retried
//! ```

use serde::{Deserialize, Serialize};

use crate::connector::ConnectorError;

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Transient,
    Permanent,
    Conflict,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Conflict => "conflict",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Bad input (unknown unit, malformed snapshot, bad config).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network, timeout, rate limit, budget exhaustion, or in-flight duplicate.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Authorization, not-found, schema mismatch.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Idempotency key reused with a different payload.
    #[error("idempotency key '{key}' reused with a different payload (stored {stored_hash}, offered {offered_hash})")]
    Conflict {
        key: String,
        stored_hash: String,
        offered_hash: String,
    },

    /// Backend (ledger, queue, audit store) failure.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::Transient(_) | Self::Store(_) => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
            Self::Conflict { .. } => ErrorClass::Conflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<ConnectorError> for ReconcileError {
    fn from(err: ConnectorError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

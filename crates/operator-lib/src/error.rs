//! Error taxonomy for the optimization operator
//!
//! Every failure path of the controller maps onto one of these classes and
//! ends in a policy status update. Only validation errors are rejected
//! synchronously; everything else is recorded and retried (or, for
//! rollback failures, escalated for manual intervention).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::GateViolation;

/// Coarse classification of an error, surfaced in policy status and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    ValidationError,
    InsufficientData,
    AnalysisTimeout,
    ApplyConflict,
    RollbackFailure,
    Internal,
}

impl ErrorClass {
    /// Label used for the `reason` dimension of failure counters
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ValidationError => "validation_error",
            ErrorClass::InsufficientData => "insufficient_data",
            ErrorClass::AnalysisTimeout => "analysis_timeout",
            ErrorClass::ApplyConflict => "apply_conflict",
            ErrorClass::RollbackFailure => "rollback_failure",
            ErrorClass::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the engine, gate, executor, stores and controller
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("validation failed: {0}")]
    Validation(#[from] GateViolation),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("analysis timed out waiting for {collaborator}")]
    AnalysisTimeout { collaborator: String },

    #[error("apply conflict on {target}: {reason}")]
    ApplyConflict { target: String, reason: String },

    #[error("rollback of {target} did not converge: {reason}")]
    RollbackFailure { target: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{store} store error: {reason}")]
    Store { store: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OptimizerError {
    pub fn store(store: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            store: store.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApplyConflict {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn rollback_failure(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RollbackFailure {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(collaborator: impl Into<String>) -> Self {
        Self::AnalysisTimeout {
            collaborator: collaborator.into(),
        }
    }

    /// Classify this error for status reporting
    pub fn class(&self) -> ErrorClass {
        match self {
            OptimizerError::Validation(_) => ErrorClass::ValidationError,
            OptimizerError::InsufficientData(_) => ErrorClass::InsufficientData,
            OptimizerError::AnalysisTimeout { .. } => ErrorClass::AnalysisTimeout,
            OptimizerError::ApplyConflict { .. } => ErrorClass::ApplyConflict,
            OptimizerError::RollbackFailure { .. } => ErrorClass::RollbackFailure,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether the controller may retry automatically on a later cycle
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OptimizerError::Validation(_) | OptimizerError::RollbackFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

//! Error types returned by node operations

use thiserror::Error;

use crate::persistence::StoreError;

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors surfaced to the caller of the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("could not find service: {0}")]
    NotFound(String),

    #[error("stone {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("failed to create stone files for {name}: {reason}")]
    ProvisionFilesFailed { name: String, reason: String },

    #[error("insufficient memory: requested {requested}, available {available}")]
    InsufficientMemory { requested: i64, available: i64 },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("could not clean up service {name}: {reason}")]
    Cleanup { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub(crate) fn startup(name: &str, reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn files(name: &str, reason: impl Into<String>) -> Self {
        Self::ProvisionFilesFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cleanup(name: &str, reason: impl Into<String>) -> Self {
        Self::Cleanup {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used in wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPlan(_) => "invalid_plan",
            Self::NotFound(_) => "not_found",
            Self::StartupFailed { .. } => "startup_failed",
            Self::ProvisionFilesFailed { .. } => "provision_files_failed",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::Persistence(_) => "persistence",
            Self::Cleanup { .. } => "cleanup",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

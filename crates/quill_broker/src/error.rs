//! Failure taxonomy surfaced by the broker lifecycle.
//!
//! Internal helpers return `anyhow::Result` with context; component boundaries
//! classify failures into `BrokerError` so supervisors can react by kind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::types::{BrokerState, TopicPartition};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The membership/registration service did not answer within its bound.
    #[error("{service} unavailable within {timeout:?}")]
    DependencyTimeout { service: String, timeout: Duration },

    /// I/O failure reading or writing durable state.
    #[error("storage failure at {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// On-disk state exists but cannot be trusted.
    #[error("storage corruption at {}: {detail}", path.display())]
    StorageCorruption { path: PathBuf, detail: String },

    /// A bounded shutdown step overran its budget.
    #[error("{component} did not stop within {budget:?}")]
    ShutdownTimeout { component: String, budget: Duration },

    #[error("broker is {actual}, expected {expected}")]
    InvalidState {
        expected: BrokerState,
        actual: BrokerState,
    },

    #[error("unknown partition {0}")]
    UnknownPartition(TopicPartition),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification of a `BrokerError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    DependencyTimeout,
    StorageFailure,
    StorageCorruption,
    ShutdownTimeout,
    InvalidState,
    UnknownPartition,
    Internal,
}

impl BrokerError {
    pub fn storage_failure(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::StorageFailure {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corruption(path: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        Self::StorageCorruption {
            path: path.as_ref().to_path_buf(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DependencyTimeout { .. } => FailureKind::DependencyTimeout,
            Self::StorageFailure { .. } => FailureKind::StorageFailure,
            Self::StorageCorruption { .. } => FailureKind::StorageCorruption,
            Self::ShutdownTimeout { .. } => FailureKind::ShutdownTimeout,
            Self::InvalidState { .. } => FailureKind::InvalidState,
            Self::UnknownPartition(_) => FailureKind::UnknownPartition,
            Self::Internal(_) => FailureKind::Internal,
        }
    }
}

use phpswitch_core::EngineError;
use phpswitch_model::StoreError;
use phpswitch_platform::{AppPathsError, ElevationError};
use thiserror::Error;

use crate::op_lock::LockError;
use crate::selection::SelectorError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve application paths: {0}")]
    Paths(#[from] AppPathsError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to save configuration: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("no {what} matches {selector}")]
    NoMatch {
        what: &'static str,
        selector: String,
    },
    #[error("administrator rights are required: {0}")]
    Elevation(#[from] ElevationError),
    #[error("{operation} failed: {details}")]
    OperationFailed {
        operation: &'static str,
        details: String,
    },
}

impl AppError {
    pub fn no_match(what: &'static str, selector: impl Into<String>) -> Self {
        Self::NoMatch {
            what,
            selector: selector.into(),
        }
    }

    pub fn operation_failed(operation: &'static str, details: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation,
            details: details.into(),
        }
    }

    /// Mistakes in the invocation rather than failures of the tool.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Selector(_) | Self::NoMatch { .. } | Self::Lock(LockError::Busy)
        )
    }
}

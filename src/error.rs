//! Error types for timed operations

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors recorded on a timed operation.
///
/// The only built-in failure cause is the deadline expiring; everything else
/// that can go wrong belongs to the payload and is reported through whatever
/// channel the host uses for its own results.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OperationError {
    /// The operation consumed its entire time budget before finishing.
    #[error("operation timed out after consuming its {budget:?} budget")]
    Timeout {
        /// The total timeout period the operation was created with.
        budget: Duration,
    },
}

impl OperationError {
    /// Check whether this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, OperationError::Timeout { .. })
    }
}

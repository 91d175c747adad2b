//! Read-only snapshot of an operation's observable state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::operation::OperationId;

/// Coarse lifecycle phase derived from the state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// `start()` has not been called yet.
    NotStarted,
    /// Started and currently executing.
    Running,
    /// Started, suspended by `pause()`, deadline countdown frozen.
    Paused,
    /// Terminal. Check `cancelled`/`timed_out` for the cause.
    Finished,
}

/// A point-in-time view of an operation, taken under its lock.
///
/// Snapshots are what callbacks and state-change subscribers receive: a
/// value, never a live reference to the operation, so observers cannot keep
/// the operation alive or mutate it re-entrantly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    /// Identity of the operation this snapshot was taken from.
    pub id: OperationId,
    /// Whether `start()` has been called.
    pub has_started: bool,
    /// Whether the operation is currently suspended.
    pub paused: bool,
    /// Whether the operation is currently executing.
    pub executing: bool,
    /// Whether the operation has reached its terminal state.
    pub finished: bool,
    /// Whether the operation was cancelled (explicitly or via timeout).
    pub cancelled: bool,
    /// Whether cancellation was caused by the deadline expiring.
    pub timed_out: bool,
    /// Unconsumed portion of the timeout budget, while started and not
    /// finished. `None` for unbounded or not-yet-started operations and once
    /// the operation is finished.
    pub time_remaining: Option<Duration>,
    /// The recorded error, populated exactly when `timed_out` is set.
    pub error: Option<OperationError>,
    /// Wall-clock time at which the terminal transition committed.
    pub finished_at: Option<DateTime<Utc>>,
}

impl OperationSnapshot {
    /// Derive the lifecycle phase from the flags.
    pub fn phase(&self) -> Phase {
        if self.finished {
            Phase::Finished
        } else if self.paused {
            Phase::Paused
        } else if self.executing {
            Phase::Running
        } else {
            Phase::NotStarted
        }
    }
}

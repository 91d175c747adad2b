//! Operation state flags and terminal transitions

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::dispatch::TerminationCause;
use crate::error::OperationError;
use crate::operation::OperationId;
use crate::timer::Countdown;

use super::OperationSnapshot;

/// Mutable state of one operation, guarded by the operation's lock.
///
/// Every mutator of [`crate::TimedOperation`] read-modify-writes these flags,
/// so they live behind a single mutex and all commits happen while it is
/// held. The terminal transition is the tie-breaker between racing causes:
/// whichever caller flips `finished` first wins, and everyone else backs off.
#[derive(Debug)]
pub(crate) struct OpState {
    pub has_started: bool,
    pub paused: bool,
    pub executing: bool,
    pub finished: bool,
    pub cancelled: bool,
    pub timed_out: bool,
    /// Remaining-duration bookkeeping for the deadline.
    pub countdown: Countdown,
    pub error: Option<OperationError>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Original timeout period, kept for the timeout error record.
    budget: Option<Duration>,
}

impl OpState {
    /// Create the state for a fresh, not-yet-started operation.
    pub fn new(timeout_period: Option<Duration>) -> Self {
        Self {
            has_started: false,
            paused: false,
            executing: false,
            finished: false,
            cancelled: false,
            timed_out: false,
            countdown: Countdown::new(timeout_period),
            error: None,
            finished_at: None,
            budget: timeout_period,
        }
    }

    /// Commit the terminal transition for the given cause.
    ///
    /// Callers must have verified `!self.finished` under the same lock hold;
    /// this is the "atomic not-finished → finished" step that decides races
    /// between timeout, explicit cancel and normal completion.
    pub fn commit_terminal(&mut self, cause: TerminationCause) {
        debug_assert!(!self.finished, "terminal transition committed twice");

        self.executing = false;
        self.paused = false;
        self.finished = true;
        self.finished_at = Some(Utc::now());
        self.countdown.clear();

        match cause {
            TerminationCause::TimedOut => {
                self.timed_out = true;
                self.cancelled = true;
                self.error = Some(OperationError::Timeout {
                    budget: self.budget.unwrap_or(Duration::ZERO),
                });
            }
            TerminationCause::Cancelled => {
                self.cancelled = true;
            }
            TerminationCause::Finished => {}
        }
    }

    /// Take a consistent snapshot of the flags as of `now`.
    pub fn snapshot(&self, id: OperationId, now: Instant) -> OperationSnapshot {
        let time_remaining = if self.has_started && !self.finished {
            self.countdown.remaining_at(now)
        } else {
            None
        };

        OperationSnapshot {
            id,
            has_started: self.has_started,
            paused: self.paused,
            executing: self.executing,
            finished: self.finished,
            cancelled: self.cancelled,
            timed_out: self.timed_out,
            time_remaining,
            error: self.error.clone(),
            finished_at: self.finished_at,
        }
    }
}

//! Timed operation façade
//!
//! Composes the state machine, the deadline countdown and the completion
//! dispatcher into the object the host executor manipulates. The façade does
//! not run the payload and does not decide when `did_finish()` is called;
//! the host-supplied variant that executes the work owes exactly one
//! `did_finish()` on normal completion.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{OperationConfig, OperationKind, TimeoutPolicy};
use crate::dispatch::{CompletionDispatcher, TerminationCause};
use crate::error::OperationError;
use crate::state::{OpState, OperationSnapshot, Phase};
use crate::timer::{TimeoutHandler, TimerService};

/// Opaque identity of a timed operation, stable for its lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocate the next process-unique identity.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Shared core of one operation: everything the handle, the timer-service
/// driver and the dispatcher touch. All flag mutation happens under the
/// state mutex, which is never held across an await point.
#[derive(Debug)]
pub(crate) struct OperationCore {
    id: OperationId,
    state: Mutex<OpState>,
    dispatcher: CompletionDispatcher,
    timer: TimerService,
    updates: watch::Sender<OperationSnapshot>,
}

impl OperationCore {
    fn state(&self) -> MutexGuard<'_, OpState> {
        // Nothing panics while holding this lock, so poison can only be
        // inherited from a prior recovered panic; keep the state usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a snapshot to subscribers.
    ///
    /// Must be called while the state lock is held: publish order then
    /// matches commit order, so the channel can never end up holding a
    /// pre-terminal snapshot after a terminal transition. `send_replace`
    /// never blocks, and the lock is never held across an await.
    fn publish(&self, snapshot: OperationSnapshot) {
        self.updates.send_replace(snapshot);
    }
}

impl TimeoutHandler for OperationCore {
    fn deadline_fired(&self, generation: u64) -> Option<(Duration, u64)> {
        enum Outcome {
            Stale,
            Rearm(Duration, u64),
            TimedOut(OperationSnapshot),
        }

        let now = Instant::now();
        let outcome = {
            let mut state = self.state();
            if state.finished || generation != state.countdown.generation() {
                Outcome::Stale
            } else {
                match state.countdown.disarm(now) {
                    Some(left) if left.is_zero() => {
                        state.commit_terminal(TerminationCause::TimedOut);
                        let snapshot = state.snapshot(self.id, now);
                        self.publish(snapshot.clone());
                        Outcome::TimedOut(snapshot)
                    }
                    Some(left) => {
                        let ticket = state.countdown.arm(now);
                        Outcome::Rearm(left, ticket.generation)
                    }
                    // An unbounded operation never arms, so a fire for it is
                    // stale by definition.
                    None => Outcome::Stale,
                }
            }
        };

        match outcome {
            Outcome::Stale => {
                debug!(id = %self.id, generation, "stale deadline fire suppressed");
                None
            }
            Outcome::Rearm(after, generation) => Some((after, generation)),
            Outcome::TimedOut(snapshot) => {
                debug!(id = %self.id, "operation timed out");
                self.dispatcher.dispatch(TerminationCause::TimedOut, snapshot);
                None
            }
        }
    }
}

impl Drop for OperationCore {
    fn drop(&mut self) {
        // Crossed resume/terminate traffic can leave an armed entry behind
        // even when the local flags say otherwise, so always ask the driver
        // to drop ours; removal of an absent entry is a no-op.
        self.timer.release(self.id);
    }
}

/// A cancelable, pausable, deadline-bound unit of work.
///
/// The operation wraps a single externally supplied piece of work: the host
/// calls [`start`](Self::start) to begin, may [`pause`](Self::pause) and
/// [`resume`](Self::resume) it (the remaining deadline budget is frozen
/// while paused), may [`cancel`](Self::cancel) it, and must call
/// [`did_finish`](Self::did_finish) exactly once when the payload completes
/// normally. If the total executing time exceeds the timeout period, the
/// operation cancels itself and records a timeout error.
///
/// Handles are cheap to clone; all clones refer to the same operation. When
/// the last handle drops, any armed deadline is released.
///
/// ```no_run
/// use std::time::Duration;
/// use timebox::TimedOperation;
///
/// # async fn example() {
/// let op = TimedOperation::with_timeout(Duration::from_secs(30));
/// op.on_timeout(|snap| println!("{} ran out of time", snap.id));
/// op.on_completion(|snap| println!("{} done", snap.id));
///
/// op.start().await;
/// // ... run the payload, then:
/// op.did_finish().await;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TimedOperation {
    core: Arc<OperationCore>,
}

impl TimedOperation {
    /// Create an operation from configuration.
    ///
    /// # Panics
    ///
    /// Panics when `config.completion_context` is `None` and no Tokio
    /// runtime is current, since callbacks would have nowhere to run.
    pub fn new(config: OperationConfig) -> Self {
        let timeout_period = config.timeout.resolve(None);
        Self::build(timeout_period, config)
    }

    /// Create an operation for a host-supplied kind, resolving the kind's
    /// default timeout period once, now.
    pub fn for_kind<K: OperationKind + ?Sized>(kind: &K, config: OperationConfig) -> Self {
        let timeout_period = config.timeout.resolve(kind.default_timeout());
        Self::build(timeout_period, config)
    }

    /// Operation bounded by `period`, with default configuration otherwise.
    pub fn with_timeout(period: Duration) -> Self {
        Self::new(OperationConfig::with_timeout(period))
    }

    /// Operation with no deadline; terminates only via `cancel()` or
    /// `did_finish()`.
    pub fn unbounded() -> Self {
        Self::new(OperationConfig {
            timeout: TimeoutPolicy::Unbounded,
            ..OperationConfig::default()
        })
    }

    fn build(timeout_period: Option<Duration>, config: OperationConfig) -> Self {
        let id = OperationId::next();
        let context = config.completion_context.unwrap_or_else(Handle::current);
        let timer = config.timer.unwrap_or_else(TimerService::global);
        let state = OpState::new(timeout_period);
        let (updates, _) = watch::channel(state.snapshot(id, Instant::now()));

        debug!(%id, ?timeout_period, "operation created");
        Self {
            core: Arc::new(OperationCore {
                id,
                state: Mutex::new(state),
                dispatcher: CompletionDispatcher::new(
                    context,
                    config.calls_completion_after_timeout,
                ),
                timer,
                updates,
            }),
        }
    }

    /// Install the callback delivered when the operation times out.
    ///
    /// Must be set before termination; assignments after the terminal
    /// transition are ignored.
    pub fn on_timeout(&self, callback: impl FnOnce(OperationSnapshot) + Send + 'static) {
        self.core.dispatcher.set_timeout_callback(Box::new(callback));
    }

    /// Install the callback delivered when the operation completes.
    ///
    /// After a timeout, delivery additionally requires
    /// `calls_completion_after_timeout` (on by default).
    pub fn on_completion(&self, callback: impl FnOnce(OperationSnapshot) + Send + 'static) {
        self.core.dispatcher.set_completion_callback(Box::new(callback));
    }

    /// Begin execution, arming the deadline with the full timeout period.
    ///
    /// Idempotent: calling it again once started (or finished) is a no-op.
    pub async fn start(&self) {
        {
            let mut state = self.core.state();
            if state.finished || state.has_started {
                debug!(id = %self.core.id, "start ignored, already started or finished");
                return;
            }
            state.has_started = true;
        }
        debug!(id = %self.core.id, "operation started");
        self.resume_inner().await;
    }

    /// Resume a paused operation, re-arming the deadline with whatever
    /// budget was left at the last pause.
    ///
    /// Returns `false` when there is nothing to resume: not started yet,
    /// already executing, or already finished.
    pub async fn resume(&self) -> bool {
        let resumed = self.resume_inner().await;
        if !resumed {
            debug!(id = %self.core.id, "resume ignored");
        }
        resumed
    }

    /// Suspend execution, folding the elapsed executing window into the
    /// remaining deadline budget.
    ///
    /// Returns `false` when the operation is not currently executing --
    /// including when a timeout or cancellation won a race against this
    /// call.
    pub async fn pause(&self) -> bool {
        {
            let state = self.core.state();
            if state.finished || !state.executing {
                debug!(id = %self.core.id, "pause ignored, not executing");
                return false;
            }
        }

        // Wait for the deadline table to drop the entry before committing:
        // an overdue fire already in flight legitimately wins this race.
        self.core.timer.disarm(self.core.id).await;

        let now = Instant::now();
        {
            let mut state = self.core.state();
            if state.finished || !state.executing {
                debug!(id = %self.core.id, "pause lost the race to a terminal transition");
                return false;
            }
            state.executing = false;
            state.paused = true;
            state.countdown.disarm(now);
            self.core.publish(state.snapshot(self.core.id, now));
        }
        debug!(id = %self.core.id, "operation paused");
        true
    }

    /// Cancel the operation.
    ///
    /// Idempotent: a no-op once finished. A plain cancellation delivers
    /// neither callback -- the work did not finish.
    pub async fn cancel(&self) {
        self.terminate(TerminationCause::Cancelled).await;
    }

    /// Signal normal completion of the payload.
    ///
    /// A no-op once finished, so a completion racing a timeout is resolved
    /// by whichever commits first.
    pub async fn did_finish(&self) {
        self.terminate(TerminationCause::Finished).await;
    }

    async fn resume_inner(&self) -> bool {
        let now = Instant::now();
        let ticket = {
            let mut state = self.core.state();
            if state.finished || !state.has_started || state.executing {
                return false;
            }
            state.paused = false;
            state.executing = true;
            let ticket = state.countdown.arm(now);
            self.core.publish(state.snapshot(self.core.id, now));
            ticket
        };

        if let Some(after) = ticket.after {
            let handler: Arc<dyn TimeoutHandler> = self.core.clone();
            self.core
                .timer
                .arm(self.core.id, ticket.generation, after, Arc::downgrade(&handler))
                .await;
        }
        debug!(id = %self.core.id, "operation executing");
        true
    }

    async fn terminate(&self, cause: TerminationCause) {
        let snapshot = {
            let mut state = self.core.state();
            if state.finished {
                debug!(id = %self.core.id, ?cause, "already finished, ignoring");
                return;
            }
            state.commit_terminal(cause);
            // Terminal flags are committed and published before callback
            // delivery is scheduled.
            let snapshot = state.snapshot(self.core.id, Instant::now());
            self.core.publish(snapshot.clone());
            snapshot
        };
        self.core.timer.disarm(self.core.id).await;
        self.core.dispatcher.dispatch(cause, snapshot);
        debug!(id = %self.core.id, ?cause, "operation finished");
    }

    /// Identity of this operation.
    pub fn id(&self) -> OperationId {
        self.core.id
    }

    /// Point-in-time view of the observable state.
    pub fn snapshot(&self) -> OperationSnapshot {
        self.core.state().snapshot(self.core.id, Instant::now())
    }

    /// Subscribe to state-change notifications; the receiver always holds
    /// the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.core.updates.subscribe()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.snapshot().phase()
    }

    /// Whether `start()` has been called.
    pub fn has_started(&self) -> bool {
        self.core.state().has_started
    }

    /// Whether the operation is currently suspended.
    pub fn is_paused(&self) -> bool {
        self.core.state().paused
    }

    /// Whether the operation is currently executing.
    pub fn is_executing(&self) -> bool {
        self.core.state().executing
    }

    /// Whether the operation has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.core.state().finished
    }

    /// Whether the operation was cancelled, explicitly or via timeout.
    pub fn is_cancelled(&self) -> bool {
        self.core.state().cancelled
    }

    /// Whether the deadline expired before completion.
    pub fn did_timeout(&self) -> bool {
        self.core.state().timed_out
    }

    /// The recorded error, present exactly when the operation timed out.
    pub fn error(&self) -> Option<OperationError> {
        self.core.state().error.clone()
    }

    /// Unconsumed portion of the timeout budget, while started and not
    /// finished.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.snapshot().time_remaining
    }
}

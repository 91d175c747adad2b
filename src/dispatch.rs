//! Exactly-once callback delivery on the completion context

use std::fmt;
use std::sync::Mutex;

use tokio::runtime::Handle;
use tracing::debug;

use crate::state::OperationSnapshot;

/// Which cause committed the terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationCause {
    TimedOut,
    Cancelled,
    Finished,
}

type Callback = Box<dyn FnOnce(OperationSnapshot) + Send + 'static>;

struct Slots {
    timeout: Option<Callback>,
    completion: Option<Callback>,
    /// Latched on the first dispatch. Once a termination event has consumed
    /// the slots, later reassignment must not produce a second delivery.
    fired: bool,
}

/// Delivers the timeout and completion callbacks for one operation.
///
/// Delivery policy per termination cause:
///
/// | cause        | timeout callback | completion callback                       |
/// |--------------|------------------|-------------------------------------------|
/// | timed out    | invoked first    | only if `calls_completion_after_timeout`  |
/// | cancelled    | suppressed       | suppressed                                |
/// | finished     | suppressed       | invoked                                   |
///
/// Both callbacks run inside a single task spawned on the completion context,
/// which gives the strict timeout-before-completion ordering and keeps the
/// terminating caller from ever blocking on user code. The `FnOnce` slots are
/// taken under the mutex, so each callback can fire at most once no matter
/// how termination paths race.
pub(crate) struct CompletionDispatcher {
    context: Handle,
    calls_completion_after_timeout: bool,
    slots: Mutex<Slots>,
}

impl CompletionDispatcher {
    pub fn new(context: Handle, calls_completion_after_timeout: bool) -> Self {
        Self {
            context,
            calls_completion_after_timeout,
            slots: Mutex::new(Slots {
                timeout: None,
                completion: None,
                fired: false,
            }),
        }
    }

    /// Install the callback invoked when the operation times out.
    pub fn set_timeout_callback(&self, callback: Callback) {
        let mut slots = lock(&self.slots);
        if slots.fired {
            debug!("timeout callback assigned after termination, ignoring");
            return;
        }
        slots.timeout = Some(callback);
    }

    /// Install the callback invoked when the operation completes.
    pub fn set_completion_callback(&self, callback: Callback) {
        let mut slots = lock(&self.slots);
        if slots.fired {
            debug!("completion callback assigned after termination, ignoring");
            return;
        }
        slots.completion = Some(callback);
    }

    /// Deliver callbacks for the given termination cause.
    ///
    /// The caller must have committed the terminal state transition before
    /// calling this, so an observer running inside a callback always sees
    /// final flags. Returns immediately; delivery happens asynchronously.
    pub fn dispatch(&self, cause: TerminationCause, snapshot: OperationSnapshot) {
        let (timeout_cb, completion_cb) = {
            let mut slots = lock(&self.slots);
            if slots.fired {
                debug!(?cause, "termination already dispatched, suppressing");
                return;
            }
            slots.fired = true;

            match cause {
                TerminationCause::TimedOut => {
                    let completion = if self.calls_completion_after_timeout {
                        slots.completion.take()
                    } else {
                        None
                    };
                    (slots.timeout.take(), completion)
                }
                TerminationCause::Cancelled => (None, None),
                TerminationCause::Finished => (None, slots.completion.take()),
            }
        };

        if timeout_cb.is_none() && completion_cb.is_none() {
            return;
        }

        debug!(?cause, id = %snapshot.id, "scheduling callback delivery");
        self.context.spawn(async move {
            if let Some(callback) = timeout_cb {
                callback(snapshot.clone());
            }
            if let Some(callback) = completion_cb {
                callback(snapshot);
            }
        });
    }
}

impl fmt::Debug for CompletionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionDispatcher")
            .field(
                "calls_completion_after_timeout",
                &self.calls_completion_after_timeout,
            )
            .finish_non_exhaustive()
    }
}

// A panic inside user callbacks runs on the completion context, not under
// this lock, so poisoning here can only come from a panicking allocator or
// similar; recovering the inner value keeps the soft-fail policy intact.
fn lock(slots: &Mutex<Slots>) -> std::sync::MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationId;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn snapshot() -> OperationSnapshot {
        OperationSnapshot {
            id: OperationId::next(),
            has_started: true,
            paused: false,
            executing: false,
            finished: true,
            cancelled: true,
            timed_out: true,
            time_remaining: None,
            error: None,
            finished_at: None,
        }
    }

    fn dispatcher(calls_completion_after_timeout: bool) -> CompletionDispatcher {
        CompletionDispatcher::new(Handle::current(), calls_completion_after_timeout)
    }

    #[tokio::test]
    async fn timeout_runs_strictly_before_completion() {
        let dispatcher = dispatcher(true);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let log = Arc::clone(&order);
        dispatcher.set_timeout_callback(Box::new(move |_| {
            log.lock().unwrap().push("timeout");
        }));
        let log = Arc::clone(&order);
        dispatcher.set_completion_callback(Box::new(move |_| {
            log.lock().unwrap().push("completion");
            let _ = done_tx.send(());
        }));

        dispatcher.dispatch(TerminationCause::TimedOut, snapshot());
        done_rx.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["timeout", "completion"]);
    }

    #[tokio::test]
    async fn timeout_without_completion_when_configured_off() {
        let dispatcher = dispatcher(false);
        let completions = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        dispatcher.set_timeout_callback(Box::new(move |_| {
            let _ = done_tx.send(());
        }));
        let count = Arc::clone(&completions);
        dispatcher.set_completion_callback(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.dispatch(TerminationCause::TimedOut, snapshot());
        done_rx.await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_suppresses_both_callbacks() {
        let dispatcher = dispatcher(true);
        let calls = Arc::new(AtomicU64::new(0));

        let count = Arc::clone(&calls);
        dispatcher.set_timeout_callback(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));
        let count = Arc::clone(&calls);
        dispatcher.set_completion_callback(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        dispatcher.dispatch(TerminationCause::Cancelled, snapshot());
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_dispatch_is_suppressed() {
        let dispatcher = dispatcher(true);
        let completions = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        let count = Arc::clone(&completions);
        dispatcher.set_completion_callback(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        }));

        dispatcher.dispatch(TerminationCause::Finished, snapshot());
        dispatcher.dispatch(TerminationCause::Finished, snapshot());
        done_rx.await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reassignment_after_termination_never_fires() {
        let dispatcher = dispatcher(true);
        let completions = Arc::new(AtomicU64::new(0));

        dispatcher.dispatch(TerminationCause::Cancelled, snapshot());

        // The termination event has been consumed; a late callback must not
        // resurrect delivery.
        let count = Arc::clone(&completions);
        dispatcher.set_completion_callback(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));
        dispatcher.dispatch(TerminationCause::Finished, snapshot());
        tokio::task::yield_now().await;

        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }
}

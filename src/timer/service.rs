//! Shared single-threaded timer service
//!
//! One driver task owns every armed deadline in the process. Operations hand
//! off arm/disarm requests over a command channel and wait for the
//! acknowledgement, so once a mutator returns, the deadline table reflects
//! it and no stale fire can land afterwards. Because the driver is the sole
//! mutator of the table, deadline bookkeeping needs no locking, and the
//! process uses a single timer resource no matter how many operations exist.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};
use std::time::Duration;

use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::operation::OperationId;

/// Implemented by operations to receive deadline expiry from the driver.
pub(crate) trait TimeoutHandler: Send + Sync {
    /// Called on the driver thread when an armed deadline fires.
    ///
    /// Returns `Some((after, generation))` when the fire was premature and
    /// the entry should be re-armed for the remainder of the budget.
    fn deadline_fired(&self, generation: u64) -> Option<(Duration, u64)>;
}

pub(crate) enum TimerCommand {
    Arm {
        id: OperationId,
        generation: u64,
        after: Duration,
        handler: Weak<dyn TimeoutHandler>,
        ack: oneshot::Sender<()>,
    },
    Disarm {
        id: OperationId,
        ack: oneshot::Sender<()>,
    },
    /// Fire-and-forget removal, used when an operation is dropped.
    Release { id: OperationId },
}

struct Entry {
    deadline: Instant,
    generation: u64,
    handler: Weak<dyn TimeoutHandler>,
}

/// Handle to a timer service driver.
///
/// Cloning is cheap; every clone talks to the same driver. The process-wide
/// instance from [`TimerService::global`] runs on its own dedicated thread
/// and lives for the process lifetime; [`TimerService::start`] spawns a
/// private driver on the current runtime instead, which is what tests use to
/// put deadlines under Tokio's paused virtual clock.
#[derive(Debug, Clone)]
pub struct TimerService {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerService {
    /// The process-wide timer service, lazily created on first use.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<TimerService> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                // Timer infrastructure failing to come up is a fatal
                // platform-level condition.
                std::thread::Builder::new()
                    .name("timebox-timer".to_string())
                    .spawn(move || {
                        let rt = runtime::Builder::new_current_thread()
                            .enable_time()
                            .build()
                            .expect("failed to build the timer service runtime");
                        rt.block_on(drive(rx));
                    })
                    .expect("failed to spawn the timer service thread");
                info!("global timer service started");
                TimerService { tx }
            })
            .clone()
    }

    /// Start a private timer service driven by the current Tokio runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(rx));
        debug!("timer service started on the current runtime");
        TimerService { tx }
    }

    /// Schedule a one-shot deadline `after` from now and wait until the
    /// driver has recorded it.
    pub(crate) async fn arm(
        &self,
        id: OperationId,
        generation: u64,
        after: Duration,
        handler: Weak<dyn TimeoutHandler>,
    ) {
        let (ack, done) = oneshot::channel();
        let cmd = TimerCommand::Arm {
            id,
            generation,
            after,
            handler,
            ack,
        };
        if self.tx.send(cmd).is_err() {
            warn!(%id, "timer service is gone, deadline not armed");
            return;
        }
        let _ = done.await;
    }

    /// Remove any pending deadline and wait until the driver has done so.
    ///
    /// After this returns, no further fire for a previously armed deadline
    /// can reach the operation.
    pub(crate) async fn disarm(&self, id: OperationId) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(TimerCommand::Disarm { id, ack }).is_err() {
            warn!(%id, "timer service is gone, nothing to disarm");
            return;
        }
        let _ = done.await;
    }

    /// Best-effort removal for `Drop` paths, where waiting is not possible.
    pub(crate) fn release(&self, id: OperationId) {
        let _ = self.tx.send(TimerCommand::Release { id });
    }
}

/// Driver loop: waits for commands and for the earliest pending deadline.
async fn drive(mut rx: mpsc::UnboundedReceiver<TimerCommand>) {
    let mut entries: HashMap<OperationId, Entry> = HashMap::new();

    loop {
        let next = entries.values().map(|entry| entry.deadline).min();

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => apply(&mut entries, cmd),
                // Every handle dropped: nothing can ever arm again.
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                fire_due(&mut entries);
            }
        }
    }

    debug!("timer service driver stopped");
}

fn apply(entries: &mut HashMap<OperationId, Entry>, cmd: TimerCommand) {
    match cmd {
        TimerCommand::Arm {
            id,
            generation,
            after,
            handler,
            ack,
        } => {
            debug!(%id, generation, ?after, "deadline armed");
            entries.insert(
                id,
                Entry {
                    deadline: Instant::now() + after,
                    generation,
                    handler,
                },
            );
            let _ = ack.send(());
        }
        TimerCommand::Disarm { id, ack } => {
            if entries.remove(&id).is_some() {
                debug!(%id, "deadline disarmed");
            }
            let _ = ack.send(());
        }
        TimerCommand::Release { id } => {
            if entries.remove(&id).is_some() {
                debug!(%id, "deadline released on drop");
            }
        }
    }
}

fn fire_due(entries: &mut HashMap<OperationId, Entry>) {
    let now = Instant::now();
    let due: Vec<OperationId> = entries
        .iter()
        .filter(|(_, entry)| entry.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    for id in due {
        let Some(entry) = entries.remove(&id) else {
            continue;
        };
        match entry.handler.upgrade() {
            Some(handler) => {
                debug!(%id, generation = entry.generation, "deadline fired");
                if let Some((after, generation)) = handler.deadline_fired(entry.generation) {
                    // Premature fire on a coarse clock: put the remainder back.
                    debug!(%id, generation, ?after, "budget not exhausted, re-arming");
                    entries.insert(
                        id,
                        Entry {
                            deadline: now + after,
                            generation,
                            handler: entry.handler,
                        },
                    );
                }
            }
            None => debug!(%id, "operation dropped before its deadline fired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    struct Recorder {
        fires: Arc<AtomicU64>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, Arc<AtomicU64>) {
            let fires = Arc::new(AtomicU64::new(0));
            (
                Arc::new(Self {
                    fires: Arc::clone(&fires),
                }),
                fires,
            )
        }
    }

    impl TimeoutHandler for Recorder {
        fn deadline_fired(&self, _generation: u64) -> Option<(Duration, u64)> {
            self.fires.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn weak_handler(recorder: &Arc<Recorder>) -> Weak<dyn TimeoutHandler> {
        let arc: Arc<dyn TimeoutHandler> = recorder.clone();
        Arc::downgrade(&arc)
    }

    #[tokio::test(start_paused = true)]
    async fn armed_deadline_fires_once() {
        let service = TimerService::start();
        let (recorder, fires) = Recorder::new();
        let id = OperationId::next();

        service
            .arm(id, 1, Duration::from_millis(100), weak_handler(&recorder))
            .await;

        sleep(Duration::from_millis(150)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_the_fire() {
        let service = TimerService::start();
        let (recorder, fires) = Recorder::new();
        let id = OperationId::next();

        service
            .arm(id, 1, Duration::from_millis(100), weak_handler(&recorder))
            .await;
        service.disarm(id).await;

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_previous_deadline() {
        let service = TimerService::start();
        let (recorder, fires) = Recorder::new();
        let id = OperationId::next();

        service
            .arm(id, 1, Duration::from_millis(100), weak_handler(&recorder))
            .await;
        service
            .arm(id, 2, Duration::from_millis(500), weak_handler(&recorder))
            .await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_operation_does_not_fire() {
        let service = TimerService::start();
        let (recorder, fires) = Recorder::new();
        let id = OperationId::next();

        let weak = weak_handler(&recorder);
        service.arm(id, 1, Duration::from_millis(50), weak).await;

        // Last strong reference goes away before the deadline.
        drop(recorder);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_an_unknown_id_is_a_no_op() {
        let service = TimerService::start();
        let (recorder, fires) = Recorder::new();

        service.release(OperationId::next());

        let id = OperationId::next();
        service
            .arm(id, 1, Duration::from_millis(50), weak_handler(&recorder))
            .await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    struct Premature {
        fires: AtomicU64,
    }

    impl TimeoutHandler for Premature {
        fn deadline_fired(&self, generation: u64) -> Option<(Duration, u64)> {
            if self.fires.fetch_add(1, Ordering::SeqCst) == 0 {
                // First fire reports half the budget still unconsumed.
                Some((Duration::from_millis(50), generation + 1))
            } else {
                None
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn premature_fire_is_rearmed_for_the_remainder() {
        let service = TimerService::start();
        let handler = Arc::new(Premature {
            fires: AtomicU64::new(0),
        });
        let id = OperationId::next();

        let arc: Arc<dyn TimeoutHandler> = handler.clone();
        service
            .arm(id, 1, Duration::from_millis(50), Arc::downgrade(&arc))
            .await;

        sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.fires.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(handler.fires.load(Ordering::SeqCst), 2);
    }
}

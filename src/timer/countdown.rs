//! Remaining-duration bookkeeping for a single deadline

use std::time::Duration;

use tokio::time::Instant;

/// Tracks how much of an operation's timeout budget is left.
///
/// The deadline is kept as a remaining *duration* rather than an absolute
/// instant: every arm/disarm pair folds the elapsed executing window into the
/// running total, so any sequence of pause/resume windows consumes exactly
/// the original budget and no more.
///
/// The generation counter invalidates in-flight deadline fires: every state
/// transition that arms, disarms or clears the countdown bumps it, and a fire
/// carrying a stale generation is ignored by the operation.
#[derive(Debug)]
pub(crate) struct Countdown {
    remaining: Option<Duration>,
    armed_at: Option<Instant>,
    generation: u64,
}

/// What the timer service should schedule after an arm.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArmTicket {
    pub generation: u64,
    /// Time until the deadline; `None` when the budget is unbounded and no
    /// timer should be scheduled at all.
    pub after: Option<Duration>,
}

impl Countdown {
    /// Create a countdown with the full budget unconsumed.
    ///
    /// `None` means unbounded: arming never schedules anything.
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            remaining: budget,
            armed_at: None,
            generation: 0,
        }
    }

    /// Begin an executing window at `now`.
    pub fn arm(&mut self, now: Instant) -> ArmTicket {
        self.armed_at = Some(now);
        self.generation += 1;
        ArmTicket {
            generation: self.generation,
            after: self.remaining,
        }
    }

    /// End the current executing window at `now`, folding the elapsed time
    /// into the remaining budget, and return what is left.
    ///
    /// Saturates at zero: a disarm racing an overdue fire reports an
    /// exhausted budget rather than going negative.
    pub fn disarm(&mut self, now: Instant) -> Option<Duration> {
        self.generation += 1;
        if let Some(armed_at) = self.armed_at.take() {
            if let Some(remaining) = self.remaining {
                self.remaining = Some(remaining.saturating_sub(now.duration_since(armed_at)));
            }
        }
        self.remaining
    }

    /// Remaining budget as of `now`, accounting for the window currently
    /// executing (if any) without committing it.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        match (self.remaining, self.armed_at) {
            (Some(remaining), Some(armed_at)) => {
                Some(remaining.saturating_sub(now.duration_since(armed_at)))
            }
            (remaining, _) => remaining,
        }
    }

    /// Drop all bookkeeping; used when the operation reaches its terminal
    /// state and the remaining budget stops being meaningful.
    pub fn clear(&mut self) {
        self.remaining = None;
        self.armed_at = None;
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn disarm_folds_elapsed_time_into_the_budget() {
        let mut countdown = Countdown::new(Some(Duration::from_secs(1)));

        countdown.arm(Instant::now());
        advance(Duration::from_millis(300)).await;

        let left = countdown.disarm(Instant::now());
        assert_eq!(left, Some(Duration::from_millis(700)));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_windows_sum_to_the_original_budget() {
        let mut countdown = Countdown::new(Some(Duration::from_secs(1)));

        countdown.arm(Instant::now());
        advance(Duration::from_millis(200)).await;
        countdown.disarm(Instant::now());

        // Time spent paused is free.
        advance(Duration::from_secs(30)).await;

        countdown.arm(Instant::now());
        advance(Duration::from_millis(300)).await;
        let left = countdown.disarm(Instant::now());

        assert_eq!(left, Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_disarm_saturates_at_zero() {
        let mut countdown = Countdown::new(Some(Duration::from_millis(100)));

        countdown.arm(Instant::now());
        advance(Duration::from_secs(2)).await;

        assert_eq!(countdown.disarm(Instant::now()), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_budget_never_schedules() {
        let mut countdown = Countdown::new(None);

        let ticket = countdown.arm(Instant::now());
        assert_eq!(ticket.after, None);

        advance(Duration::from_secs(3600)).await;
        assert_eq!(countdown.disarm(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_at_reports_the_live_window_without_committing() {
        let mut countdown = Countdown::new(Some(Duration::from_secs(1)));

        countdown.arm(Instant::now());
        advance(Duration::from_millis(400)).await;

        assert_eq!(
            countdown.remaining_at(Instant::now()),
            Some(Duration::from_millis(600))
        );
        // The committed budget is untouched until disarm.
        assert_eq!(countdown.disarm(Instant::now()), Some(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn every_transition_bumps_the_generation() {
        let mut countdown = Countdown::new(Some(Duration::from_secs(1)));
        let g0 = countdown.generation();

        let ticket = countdown.arm(Instant::now());
        assert!(ticket.generation > g0);

        countdown.disarm(Instant::now());
        assert!(countdown.generation() > ticket.generation);

        let before_clear = countdown.generation();
        countdown.clear();
        assert!(countdown.generation() > before_clear);
    }
}

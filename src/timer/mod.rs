//! Deadline tracking module
//!
//! Countdown bookkeeping keeps the deadline as a remaining duration that
//! survives pause/resume; the service schedules and fires all deadlines in
//! the process from a single driver.

mod countdown;
pub mod service;

// Re-export main types
pub(crate) use countdown::Countdown;
pub(crate) use service::TimeoutHandler;
pub use service::TimerService;

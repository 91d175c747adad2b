//! Timebox - a deadline-bound, pausable, cancelable unit-of-work primitive
//!
//! This library wraps a single externally supplied piece of asynchronous
//! work in an operation that can be started, paused and resumed (the
//! remaining deadline budget survives suspensions), cancelled, and that
//! cancels itself when its total executing time exceeds the timeout period.
//! All deadlines in the process are driven by one shared single-threaded
//! timer service; completion and timeout callbacks are delivered exactly
//! once on a configurable Tokio runtime handle.

pub mod config;
mod dispatch;
pub mod error;
pub mod operation;
pub mod state;
pub mod timer;

// Re-export commonly used types
pub use config::{OperationConfig, OperationKind, TimeoutPolicy};
pub use error::OperationError;
pub use operation::{OperationId, TimedOperation};
pub use state::{OperationSnapshot, Phase};
pub use timer::TimerService;

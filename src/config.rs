//! Per-operation configuration

use std::time::Duration;

use tokio::runtime::Handle;

use crate::timer::TimerService;

/// How an operation's timeout period is chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Use the default timeout of the operation's kind ([`OperationKind`]),
    /// or unbounded when constructed without a kind.
    #[default]
    Default,
    /// Never time out; the operation only terminates via `cancel()` or
    /// `did_finish()`.
    Unbounded,
    /// Time out after the given total executing duration.
    After(Duration),
}

impl TimeoutPolicy {
    /// Resolve the policy against a kind's default, once, at construction.
    pub(crate) fn resolve(self, kind_default: Option<Duration>) -> Option<Duration> {
        match self {
            TimeoutPolicy::Default => kind_default,
            TimeoutPolicy::Unbounded => None,
            TimeoutPolicy::After(period) => Some(period),
        }
    }
}

/// A variant of timed work with its own default timeout period.
///
/// Implemented by host-supplied operation kinds; the default is read once
/// when the operation is constructed, never re-consulted afterwards.
pub trait OperationKind {
    /// Default timeout period for operations of this kind.
    ///
    /// `None` means unbounded.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Configuration for a [`crate::TimedOperation`].
///
/// Construct with struct-update syntax:
///
/// ```no_run
/// use std::time::Duration;
/// use timebox::{OperationConfig, TimeoutPolicy};
///
/// let config = OperationConfig {
///     timeout: TimeoutPolicy::After(Duration::from_secs(30)),
///     ..OperationConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// Timeout selection, resolved once at construction.
    pub timeout: TimeoutPolicy,
    /// Whether the completion callback also runs after a timeout, once the
    /// timeout callback has been delivered. Defaults to `true`.
    pub calls_completion_after_timeout: bool,
    /// Runtime handle callbacks are delivered on. `None` uses the runtime
    /// current at construction.
    pub completion_context: Option<Handle>,
    /// Timer service driving the deadline. `None` uses the process-wide
    /// service; tests substitute [`TimerService::start`] to run deadlines on
    /// a virtual clock.
    pub timer: Option<TimerService>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutPolicy::Default,
            calls_completion_after_timeout: true,
            completion_context: None,
            timer: None,
        }
    }
}

impl OperationConfig {
    /// Configuration with a fixed timeout period and all other defaults.
    pub fn with_timeout(period: Duration) -> Self {
        Self {
            timeout: TimeoutPolicy::After(period),
            ..Self::default()
        }
    }
}

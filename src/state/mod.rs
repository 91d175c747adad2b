//! State management module
//!
//! This module contains the operation state machine and the read-only
//! snapshot views handed to callbacks and state-change subscribers.

mod op_state;
pub mod snapshot;

// Re-export main types
pub(crate) use op_state::OpState;
pub use snapshot::{OperationSnapshot, Phase};

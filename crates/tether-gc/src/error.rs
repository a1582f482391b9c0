//! Error types for handle tracking

use crate::slot::{DisposalState, SlotId};
use thiserror::Error;

/// Errors raised by the arena, the handle table and the reaper
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// Stale or out-of-range slot id
    #[error("slot {0} not found")]
    NotFound(SlotId),

    /// A lifecycle rule was broken by the caller
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The arena could not grow
    #[error("slot arena exhausted: could not reserve {requested} slots")]
    ResourceExhaustion {
        /// Slot count that was being reserved
        requested: usize,
    },

    /// The entry has already been handed to the native collector
    #[error("slot {id} is {state} and cannot be resurrected")]
    NotResurrectable {
        /// Entry that was asked for
        id: SlotId,
        /// State observed at the time of the request
        state: DisposalState,
    },

    /// The background reclaimer is no longer running
    #[error("background reclaimer is not running")]
    ReaperStopped,

    /// The background reclaimer thread could not be started
    #[error("failed to spawn background reclaimer: {0}")]
    Spawn(String),
}

/// Result type for handle tracking operations
pub type GcResult<T> = Result<T, GcError>;

/// Report a broken lifecycle rule.
///
/// Always logged; fatal under `debug_assertions`, returned as an error otherwise.
pub(crate) fn invariant_violation(message: impl Into<String>) -> GcError {
    let message = message.into();
    tracing::error!(%message, "handle invariant violated");
    if cfg!(debug_assertions) {
        panic!("invariant violation: {message}");
    }
    GcError::InvariantViolation(message)
}

//! Error types for tether-bridge
//!
//! Wraps handle tracking errors from tether-gc and adds bridge-specific ones.

use crate::engine::EngineError;
use tether_gc::SlotId;
use thiserror::Error;

// Re-export tracking error types
pub use tether_gc::{GcError, GcResult};

/// Errors that can occur in bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Handle tracking error
    #[error(transparent)]
    Gc(#[from] GcError),

    /// The engine failed a request
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The wrapper registered for a native object has another type
    #[error("wrapper at slot {id} is {actual}, not {expected}")]
    WrapperTypeMismatch {
        /// Slot of the registered wrapper
        id: SlotId,
        /// Type the caller asked for
        expected: &'static str,
        /// Type that was registered
        actual: &'static str,
    },

    /// Configuration could not be loaded
    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for lookups of stale or unknown slots
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Gc(GcError::NotFound(_)))
    }

    /// True for broken lifecycle rules
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Gc(GcError::InvariantViolation(_)))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

//! Contract with the embedded script engine
//!
//! The bridge never touches the engine's heap directly. It asks the engine
//! to create, weaken and destroy persistent references through
//! [`NativeEngine`], and the engine reports reclamation back with the
//! [`WeakToken`] it was given.

use crate::value::HandleValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_gc::{DisposalState, SlotId};
use thiserror::Error;

/// Identity of an object owned by the engine
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeRef(u64);

impl NativeRef {
    /// Wrap a raw engine identity
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw engine identity
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NativeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeRef({:#x})", self.0)
    }
}

impl fmt::Display for NativeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which index an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedKind {
    /// A handle to a value
    Handle,
    /// A wrapper object registered for a native identity
    Object,
}

/// Token handed to the engine with a weak request.
///
/// The engine passes it back to
/// [`HandleBridge::native_reclaimed`](crate::HandleBridge::native_reclaimed)
/// once its collector has reclaimed the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakToken {
    /// Index the entry lives in
    pub kind: TrackedKind,
    /// Slot of the entry
    #[serde(with = "slot_repr")]
    pub slot: SlotId,
}

mod slot_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use tether_gc::SlotId;

    pub fn serialize<S: Serializer>(slot: &SlotId, serializer: S) -> Result<S::Ok, S::Error> {
        (slot.index(), slot.generation()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SlotId, D::Error> {
        let (index, generation) = <(u32, u32)>::deserialize(deserializer)?;
        Ok(SlotId::new(index, generation))
    }
}

/// Errors reported by the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused the request
    #[error("engine rejected the request: {0}")]
    Rejected(String),

    /// The reference is not known to the engine
    #[error("unknown native reference {0}")]
    UnknownReference(NativeRef),

    /// The engine has been torn down
    #[error("engine has been disposed")]
    Disposed,
}

/// Operations the bridge needs from the embedded engine.
///
/// Calls may arrive from the reaper thread as well as from callers of the
/// bridge; none of them is made while a bridge lock is held.
pub trait NativeEngine: Send + Sync + 'static {
    /// Create a persistent reference holding `value`
    fn create_native_reference(&self, value: &HandleValue) -> Result<NativeRef, EngineError>;

    /// Drop a persistent reference without waiting for the collector
    fn destroy_native_reference(&self, native: NativeRef);

    /// Turn the persistent reference into a weak one.
    ///
    /// When the engine's collector reclaims the object it must report `token`
    /// back through the bridge.
    fn mark_weak(&self, native: NativeRef, token: WeakToken) -> Result<(), EngineError>;

    /// Offer the engine's collector up to `budget_ms` of work.
    ///
    /// Returns true when the engine has nothing left to collect.
    fn idle_notification(&self, budget_ms: u64) -> bool;

    /// Describe the value behind an existing reference
    fn describe(&self, native: NativeRef) -> Result<HandleValue, EngineError>;

    /// Disposal state as the engine sees it, for engines that can be polled
    fn native_state(&self, _native: NativeRef) -> Option<DisposalState> {
        None
    }
}

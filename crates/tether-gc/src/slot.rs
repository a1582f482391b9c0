//! Slot identities and per-entry disposal state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Identity of one occupancy of an arena slot.
///
/// The index is reused once a slot is freed; the generation is bumped on
/// every free so an id held from a previous occupant never matches the new one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Create an id from its raw parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Position of the slot in the arena
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Occupancy counter of the slot
    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) const fn slot(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({}@{})", self.index, self.generation)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

/// Lifecycle of a tracked entry
///
/// Transitions only move forward, except `ManagedUnreachable -> Active`
/// (resurrection) and `NativeWeak -> ManagedUnreachable` when the native
/// engine refuses to weaken its reference.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisposalState {
    /// At least one strong handle exists on the managed side
    Active = 0,
    /// No strong handle remains; queued for the reaper
    ManagedUnreachable = 1,
    /// The native engine has been told it may collect the object
    NativeWeak = 2,
    /// The native object is gone; the slot is cached until reused or freed
    Disposed = 3,
}

impl DisposalState {
    /// All states, in lifecycle order
    pub const ALL: [DisposalState; 4] = [
        DisposalState::Active,
        DisposalState::ManagedUnreachable,
        DisposalState::NativeWeak,
        DisposalState::Disposed,
    ];

    /// Whether a new strong handle may still be produced for the entry
    pub fn is_resurrectable(self) -> bool {
        matches!(
            self,
            DisposalState::Active | DisposalState::ManagedUnreachable
        )
    }

    /// Short label used in logs and diagnostics
    pub fn label(self) -> &'static str {
        match self {
            DisposalState::Active => "active",
            DisposalState::ManagedUnreachable => "managed-unreachable",
            DisposalState::NativeWeak => "native-weak",
            DisposalState::Disposed => "disposed",
        }
    }
}

impl From<u8> for DisposalState {
    fn from(v: u8) -> Self {
        match v {
            0 => DisposalState::Active,
            1 => DisposalState::ManagedUnreachable,
            2 => DisposalState::NativeWeak,
            _ => DisposalState::Disposed,
        }
    }
}

impl fmt::Display for DisposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Atomic holder for a [`DisposalState`]
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: DisposalState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> DisposalState {
        DisposalState::from(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns the observed state on failure
    pub(crate) fn transition(
        &self,
        from: DisposalState,
        to: DisposalState,
    ) -> Result<(), DisposalState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(DisposalState::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in DisposalState::ALL {
            assert_eq!(DisposalState::from(state as u8), state);
        }
    }

    #[test]
    fn test_transition_cas() {
        let cell = StateCell::new(DisposalState::Active);
        assert!(
            cell.transition(DisposalState::Active, DisposalState::ManagedUnreachable)
                .is_ok()
        );
        assert_eq!(
            cell.transition(DisposalState::Active, DisposalState::NativeWeak),
            Err(DisposalState::ManagedUnreachable)
        );
        assert_eq!(cell.load(), DisposalState::ManagedUnreachable);
    }

    #[test]
    fn test_slot_id_display() {
        let id = SlotId::new(7, 2);
        assert_eq!(id.to_string(), "7@2");
        assert_ne!(id, SlotId::new(7, 3));
    }
}

//! # Tether GC
//!
//! Lifetime tracking for references that cross from a managed heap into an
//! independently collected native heap.
//!
//! ## Design
//!
//! - **Slot arena**: generational ids, free-list reuse, doubling growth
//! - **Weak observers**: refcount-to-zero signal with resurrection
//! - **Disposal queue**: set-like FIFO of entries the managed side let go of
//! - **Reaper**: one background thread that hands entries to the native collector

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod arena;
pub mod error;
pub mod finalization;
pub mod reaper;
pub mod safepoint;
pub mod slot;
pub mod table;
pub mod weak_ref;

pub use arena::SlotArena;
pub use error::{GcError, GcResult};
pub use finalization::DisposalQueue;
pub use reaper::{
    PassReport, ReapFault, Reaper, ReaperConfig, ReaperWaker, ReclaimWork, StepOutcome, run_pass,
};
pub use safepoint::{ReaperState, SafePoint};
pub use slot::{DisposalState, SlotId};
pub use table::{HandleTable, Reaping, TableCounts};
pub use weak_ref::{Revival, Strong, WeakObserver};

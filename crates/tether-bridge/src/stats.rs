//! Bridge statistics
//!
//! Atomic counters updated by the reaper, plus serializable snapshots for
//! diagnostics.

use crossbeam_utils::CachePadded;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_gc::TableCounts;

/// Counters updated by reclaim work
#[derive(Debug, Default)]
pub struct ReclaimStats {
    /// Entries the engine agreed to weaken
    pub marked_weak: CachePadded<AtomicU64>,
    /// Entries the engine reported as reclaimed
    pub reclaimed: CachePadded<AtomicU64>,
    /// Failed reclaim steps
    pub faults: CachePadded<AtomicU64>,
    /// Idle notifications sent to the engine
    pub idle_notifications: CachePadded<AtomicU64>,
    /// Refused entries put back on a queue
    pub retried: CachePadded<AtomicU64>,
}

impl ReclaimStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> ReclaimStatsSnapshot {
        ReclaimStatsSnapshot {
            marked_weak: self.marked_weak.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            idle_notifications: self.idle_notifications.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ReclaimStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStatsSnapshot {
    /// Entries the engine agreed to weaken
    pub marked_weak: u64,
    /// Entries the engine reported as reclaimed
    pub reclaimed: u64,
    /// Failed reclaim steps
    pub faults: u64,
    /// Idle notifications sent to the engine
    pub idle_notifications: u64,
    /// Refused entries put back on a queue
    pub retried: u64,
}

/// Counters of one tracked index
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrackedCounts {
    /// Occupied slots in any state
    pub total: usize,
    /// Entries held on the managed side
    pub active: usize,
    /// Entries waiting for the reaper
    pub pending_disposal: usize,
    /// Entries the engine may reclaim
    pub native_weak: usize,
    /// Reclaimed entries whose slot can be reused
    pub cached: usize,
    /// Slots available before growth
    pub capacity: usize,
    /// Freed slots waiting for reuse
    pub free_slots: usize,
    /// Unused share of created slots, in percent
    pub fragmentation: f64,
}

impl From<TableCounts> for TrackedCounts {
    fn from(counts: TableCounts) -> Self {
        Self {
            total: counts.total,
            active: counts.active,
            pending_disposal: counts.pending,
            native_weak: counts.native_weak,
            cached: counts.cached,
            capacity: counts.capacity,
            free_slots: counts.free_slots,
            fragmentation: counts.fragmentation,
        }
    }
}

/// Point-in-time view of a bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStats {
    /// Handle index
    pub handles: TrackedCounts,
    /// Wrapper object index
    pub objects: TrackedCounts,
    /// Reaper activity
    pub reclaim: ReclaimStatsSnapshot,
    /// Entries refused by the engine and waiting for a retry
    pub abandoned: usize,
    /// Whether background reclamation is parked
    pub reclaim_paused: bool,
}

impl BridgeStats {
    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

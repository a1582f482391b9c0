//! Handle table
//!
//! Ties the slot arena, the identity index and the disposal queue together
//! and drives every entry through its lifecycle:
//!
//! ```text
//! Active -> ManagedUnreachable -> NativeWeak -> Disposed -> (freed or recycled)
//!   ^              |
//!   +--------------+  resurrection
//! ```
//!
//! Lock order is structure, then queue, then observer. The queue never calls
//! back into the structure lock.

use crate::arena::{DEFAULT_CAPACITY, SlotArena};
use crate::error::{GcError, GcResult, invariant_violation};
use crate::finalization::DisposalQueue;
use crate::reaper::ReaperWaker;
use crate::slot::{DisposalState, SlotId};
use crate::weak_ref::{Revival, Strong, WeakObserver};
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Point-in-time counters of one table
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TableCounts {
    /// Occupied slots in any state
    pub total: usize,
    /// Entries with a live strong handle
    pub active: usize,
    /// Entries waiting for the reaper
    pub pending: usize,
    /// Entries the native collector may reclaim
    pub native_weak: usize,
    /// Reclaimed entries whose slot can be reused
    pub cached: usize,
    /// Ids currently in the disposal queue
    pub queued: usize,
    /// Slots available before the arena grows
    pub capacity: usize,
    /// Freed slots on the free list
    pub free_slots: usize,
    /// Unused share of created slots, in percent
    pub fragmentation: f64,
}

/// Per-state entry counts.
///
/// Shifts made by different threads may land out of order, so a count can
/// dip below zero for a moment; reads clamp at zero.
#[derive(Default)]
struct StateCounts([CachePadded<AtomicIsize>; 4]);

impl StateCounts {
    fn get(&self, state: DisposalState) -> usize {
        self.0[state as usize].load(Ordering::Acquire).max(0) as usize
    }

    fn add(&self, state: DisposalState) {
        self.0[state as usize].fetch_add(1, Ordering::AcqRel);
    }

    fn sub(&self, state: DisposalState) {
        self.0[state as usize].fetch_sub(1, Ordering::AcqRel);
    }

    fn shift(&self, from: DisposalState, to: DisposalState) {
        self.sub(from);
        self.add(to);
    }

    fn reset(&self) {
        for count in &self.0 {
            count.store(0, Ordering::Release);
        }
    }
}

struct Structure<T: Send + Sync + 'static> {
    arena: SlotArena<Arc<WeakObserver<T>>>,
    index: FxHashMap<u64, SlotId>,
    /// Disposed slots in the order they were reclaimed
    cached: VecDeque<SlotId>,
}

impl<T: Send + Sync + 'static> Structure<T> {
    /// Entry indexed under `key` that can still hand out strong handles
    fn live(&self, key: u64) -> Option<Arc<WeakObserver<T>>> {
        let id = self.index.get(&key)?;
        self.arena
            .get(*id)
            .filter(|observer| observer.state().is_resurrectable())
            .cloned()
    }

    fn unindex(&mut self, observer: &WeakObserver<T>) {
        if let Some(key) = observer.key() {
            if self.index.get(&key) == Some(&observer.id()) {
                self.index.remove(&key);
            }
        }
    }
}

/// Result of taking one entry off the disposal queue
pub enum Reaping<T: Send + Sync + 'static> {
    /// The entry is now `NativeWeak`; the native side must be told
    Ready(Arc<WeakObserver<T>>),
    /// The entry was resurrected or freed after it was queued
    Skipped(SlotId),
}

/// Lifecycle tracker for one kind of cross-heap entry
pub struct HandleTable<T: Send + Sync + 'static> {
    structure: RwLock<Structure<T>>,
    queue: DisposalQueue,
    counts: StateCounts,
    waker: OnceLock<ReaperWaker>,
    closed: AtomicBool,
    this: Weak<Self>,
}

impl<T: Send + Sync + 'static> HandleTable<T> {
    /// Create a table with the default initial capacity
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a table with room for `capacity` entries before growing
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            structure: RwLock::new(Structure {
                arena: SlotArena::with_capacity(capacity),
                index: FxHashMap::default(),
                cached: VecDeque::new(),
            }),
            queue: DisposalQueue::new(),
            counts: StateCounts::default(),
            waker: OnceLock::new(),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Wake this reaper whenever an entry is queued. Only the first call counts.
    pub fn set_waker(&self, waker: ReaperWaker) -> bool {
        self.waker.set(waker).is_ok()
    }

    /// Strong handle for the live entry indexed under `key`
    pub fn find(&self, key: u64) -> Option<Strong<T>> {
        let observer = self.structure.read().live(key)?;
        observer
            .strengthen(&self.this)
            .ok()
            .map(|found| self.settle(found))
    }

    /// Strong handle for `key`, creating the entry with `make` if needed.
    ///
    /// While the entry for `key` is `NativeWeak` the key cannot be acquired
    /// at all; it frees up once the native side confirms the reclaim.
    pub fn acquire(&self, key: Option<u64>, make: impl FnOnce() -> T) -> GcResult<Strong<T>> {
        if let Some(strong) = key.and_then(|key| self.find(key)) {
            return Ok(strong);
        }
        self.allocate(key, make, false)
    }

    /// Create the entry for `key`; fails if a live entry already holds it
    pub fn insert_unique(&self, key: u64, make: impl FnOnce() -> T) -> GcResult<Strong<T>> {
        self.allocate(Some(key), make, true)
    }

    fn allocate(
        &self,
        key: Option<u64>,
        make: impl FnOnce() -> T,
        unique: bool,
    ) -> GcResult<Strong<T>> {
        let mut evicted = Vec::new();
        let mut s = self.structure.write();

        if let Some((key, observer)) = key.and_then(|key| Some((key, s.live(key)?))) {
            if unique {
                return Err(invariant_violation(format!(
                    "identity {key:#x} is already tracked by slot {}",
                    observer.id()
                )));
            }
            if let Ok(found) = observer.strengthen(&self.this) {
                drop(s);
                return Ok(self.settle(found));
            }
        }

        // the engine may still reclaim an entry it was told to weaken
        if let Some(weak) = key.and_then(|key| s.arena.get(*s.index.get(&key)?)) {
            let state = weak.state();
            if state == DisposalState::NativeWeak {
                return Err(GcError::NotResurrectable {
                    id: weak.id(),
                    state,
                });
            }
        }

        if s.arena.free_count() == 0 {
            self.recycle_cached(&mut s, &mut evicted);
        }

        let target = make();
        let id = s
            .arena
            .insert_with(|id| WeakObserver::new(id, key, target))?;
        let observer = s
            .arena
            .get(id)
            .cloned()
            .ok_or(GcError::NotFound(id))?;
        if let Some(key) = key {
            s.index.insert(key, id);
        }
        let (strong, _) = observer.strengthen(&self.this)?;
        self.counts.add(DisposalState::Active);
        drop(s);

        tracing::trace!(slot = %id, recycled = evicted.len(), "slot allocated");
        Ok(strong)
    }

    /// Reuse the oldest disposed slot, if any
    fn recycle_cached(&self, s: &mut Structure<T>, evicted: &mut Vec<Arc<WeakObserver<T>>>) {
        while let Some(id) = s.cached.pop_front() {
            let disposed = s
                .arena
                .get(id)
                .is_some_and(|observer| observer.state() == DisposalState::Disposed);
            if !disposed {
                continue;
            }
            if let Some(observer) = s.arena.remove(id) {
                s.unindex(&observer);
                self.counts.sub(DisposalState::Disposed);
                evicted.push(observer);
                return;
            }
        }
    }

    fn settle(&self, (strong, revival): (Strong<T>, Revival)) -> Strong<T> {
        if revival == Revival::Resurrected {
            let observer = strong.observer();
            self.counts
                .shift(DisposalState::ManagedUnreachable, DisposalState::Active);
            self.queue
                .remove_if(observer.id(), || observer.state() == DisposalState::Active);
            tracing::trace!(slot = %observer.id(), "entry resurrected");
        }
        strong
    }

    /// Strong handle for `id`, reviving it if the reaper has not visited it
    pub fn resurrect(&self, id: SlotId) -> GcResult<Strong<T>> {
        let observer = self.observer(id).ok_or(GcError::NotFound(id))?;
        observer
            .strengthen(&self.this)
            .map(|found| self.settle(found))
    }

    /// Observer occupying `id`
    pub fn observer(&self, id: SlotId) -> Option<Arc<WeakObserver<T>>> {
        self.structure.read().arena.get(id).cloned()
    }

    /// Lifecycle state of `id`
    pub fn state(&self, id: SlotId) -> Option<DisposalState> {
        self.structure.read().arena.get(id).map(|o| o.state())
    }

    /// Slot currently indexed under `key`
    pub fn lookup(&self, key: u64) -> Option<SlotId> {
        self.structure.read().index.get(&key).copied()
    }

    /// Release a disposed slot for reuse.
    ///
    /// Freeing an entry in any other state is an invariant violation.
    pub fn free(&self, id: SlotId) -> GcResult<()> {
        let removed = {
            let mut s = self.structure.write();
            let state = s
                .arena
                .get(id)
                .map(|o| o.state())
                .ok_or(GcError::NotFound(id))?;
            if state != DisposalState::Disposed {
                return Err(invariant_violation(format!(
                    "slot {id} freed while {state}"
                )));
            }
            let removed = s.arena.remove(id);
            if let Some(observer) = &removed {
                s.unindex(observer);
            }
            removed
        };
        self.counts.sub(DisposalState::Disposed);
        drop(removed);
        tracing::trace!(slot = %id, "slot freed");
        Ok(())
    }

    /// Called when the last strong handle of a group is dropped
    pub(crate) fn on_unreachable(&self, observer: &Arc<WeakObserver<T>>, epoch: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let id = observer.id();
        let queued = self.queue.push_if(id, || {
            let marked = observer.mark_unreachable(epoch);
            if marked {
                self.counts
                    .shift(DisposalState::Active, DisposalState::ManagedUnreachable);
            }
            marked
        });
        if !queued {
            return;
        }
        tracing::trace!(slot = %id, "last managed handle dropped");
        self.wake();
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            waker.wake();
        }
    }

    /// Take the next queued entry and move it to `NativeWeak`
    pub fn begin_reap(&self) -> Option<Reaping<T>> {
        let id = self.queue.pop()?;
        let Some(observer) = self.observer(id) else {
            return Some(Reaping::Skipped(id));
        };
        match observer.transition(DisposalState::ManagedUnreachable, DisposalState::NativeWeak) {
            Ok(()) => {
                self.counts
                    .shift(DisposalState::ManagedUnreachable, DisposalState::NativeWeak);
                tracing::trace!(slot = %id, "entry handed to native collector");
                Some(Reaping::Ready(observer))
            }
            Err(state) => {
                tracing::trace!(slot = %id, %state, "queued entry skipped");
                Some(Reaping::Skipped(id))
            }
        }
    }

    /// Undo `begin_reap` after the native side refused the entry
    pub fn revert_native_weak(&self, observer: &WeakObserver<T>) -> bool {
        let reverted = observer
            .transition(DisposalState::NativeWeak, DisposalState::ManagedUnreachable)
            .is_ok();
        if reverted {
            self.counts
                .shift(DisposalState::NativeWeak, DisposalState::ManagedUnreachable);
        }
        reverted
    }

    /// Put a `ManagedUnreachable` entry back on the queue
    pub fn requeue(&self, id: SlotId) -> bool {
        let Some(observer) = self.observer(id) else {
            return false;
        };
        let queued = self.queue.push_if(id, || {
            observer.state() == DisposalState::ManagedUnreachable
        });
        if queued {
            self.wake();
        }
        queued
    }

    /// Record that the native collector reclaimed `id`.
    ///
    /// The slot stays occupied as `Disposed` until it is freed or recycled.
    /// Returns false when the reclaim was already recorded.
    pub fn confirm_reclaimed(&self, id: SlotId) -> GcResult<bool> {
        let observer = self.observer(id).ok_or(GcError::NotFound(id))?;
        match observer.transition(DisposalState::NativeWeak, DisposalState::Disposed) {
            Ok(()) => {}
            Err(DisposalState::Disposed) => {
                tracing::trace!(slot = %id, "reclaim already recorded");
                return Ok(false);
            }
            Err(state) => {
                return Err(invariant_violation(format!(
                    "slot {id} reported reclaimed while {state}"
                )));
            }
        }
        self.counts
            .shift(DisposalState::NativeWeak, DisposalState::Disposed);

        let mut s = self.structure.write();
        s.unindex(&observer);
        s.cached.push_back(id);
        drop(s);

        tracing::trace!(slot = %id, "native side reclaimed entry");
        Ok(true)
    }

    /// Slots currently in `state`, in slot order
    pub fn ids_in_state(&self, state: DisposalState) -> Vec<SlotId> {
        self.structure
            .read()
            .arena
            .iter()
            .filter(|(_, observer)| observer.state() == state)
            .map(|(id, _)| id)
            .collect()
    }

    /// The disposal queue
    pub fn queue(&self) -> &DisposalQueue {
        &self.queue
    }

    /// Entries in `state`, without locking the structure
    pub fn count(&self, state: DisposalState) -> usize {
        self.counts.get(state)
    }

    /// Occupied slots
    pub fn len(&self) -> usize {
        self.structure.read().arena.len()
    }

    /// True when no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all counters
    pub fn counts(&self) -> TableCounts {
        let s = self.structure.read();
        TableCounts {
            total: s.arena.len(),
            active: self.counts.get(DisposalState::Active),
            pending: self.counts.get(DisposalState::ManagedUnreachable),
            native_weak: self.counts.get(DisposalState::NativeWeak),
            cached: self.counts.get(DisposalState::Disposed),
            queued: self.queue.len(),
            capacity: s.arena.capacity(),
            free_slots: s.arena.free_count(),
            fragmentation: s.arena.fragmentation(),
        }
    }

    /// Stop tracking and hand back every entry.
    ///
    /// Handles still held by callers keep their value but no longer report
    /// back to the table.
    pub fn close(&self) -> Vec<Arc<WeakObserver<T>>> {
        self.closed.store(true, Ordering::Release);
        let mut s = self.structure.write();
        let observers = s.arena.drain();
        s.index.clear();
        s.cached.clear();
        drop(s);
        self.queue.clear();
        self.counts.reset();
        observers
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("counts", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_same_key() {
        let table = HandleTable::new();
        let a = table.acquire(Some(10), || "a").unwrap();
        let b = table.acquire(Some(10), || "b").unwrap();
        assert!(a.same_entry(&b));
        assert_eq!(*b, "a");
        assert_eq!(table.count(DisposalState::Active), 1);
    }

    #[test]
    fn test_drop_queues_entry() {
        let table = HandleTable::new();
        let a = table.acquire(Some(1), || 1u32).unwrap();
        let id = a.id();
        drop(a);
        assert_eq!(table.state(id), Some(DisposalState::ManagedUnreachable));
        assert_eq!(table.queue().snapshot(), vec![id]);

        let revived = table.resurrect(id).unwrap();
        assert_eq!(revived.state(), DisposalState::Active);
        assert!(table.queue().is_empty());
        assert_eq!(table.counts().pending, 0);
    }

    #[test]
    fn test_reclaim_and_recycle() {
        let table = HandleTable::with_capacity(1);
        let a = table.acquire(Some(1), || 1u32).unwrap();
        let id = a.id();
        drop(a);

        let Some(Reaping::Ready(observer)) = table.begin_reap() else {
            panic!("expected a ready entry");
        };
        assert_eq!(observer.id(), id);
        assert!(table.resurrect(id).is_err());
        table.confirm_reclaimed(id).unwrap();
        assert_eq!(table.lookup(1), None);

        // no free slot, so the cached one is recycled
        let b = table.acquire(Some(2), || 2u32).unwrap();
        assert_eq!(b.id().index(), id.index());
        assert_ne!(b.id(), id);
        assert_eq!(table.state(id), None);
        assert_eq!(table.counts().cached, 0);
    }

    #[test]
    fn test_native_weak_key_blocked_until_reclaimed() {
        let table = HandleTable::new();
        let a = table.acquire(Some(5), || "old").unwrap();
        let old = a.id();
        drop(a);
        table.begin_reap();

        let err = table.acquire(Some(5), || "new").unwrap_err();
        assert_eq!(
            err,
            GcError::NotResurrectable {
                id: old,
                state: DisposalState::NativeWeak
            }
        );
        assert!(matches!(
            table.insert_unique(5, || "new"),
            Err(GcError::NotResurrectable { .. })
        ));
        assert_eq!(table.counts().total, 1);

        assert!(table.confirm_reclaimed(old).unwrap());
        let b = table.acquire(Some(5), || "new").unwrap();
        assert_ne!(b.id(), old);
        assert_eq!(table.lookup(5), Some(b.id()));
    }

    #[test]
    fn test_duplicate_reclaim_report() {
        let table = HandleTable::new();
        let id = table.acquire(None, || 1u8).unwrap().id();
        table.begin_reap();

        assert!(table.confirm_reclaimed(id).unwrap());
        assert!(!table.confirm_reclaimed(id).unwrap());
        assert_eq!(table.counts().cached, 1);
        assert_eq!(table.counts().native_weak, 0);
    }

    #[test]
    fn test_counts_never_wrap() {
        let counts = StateCounts::default();
        // a sub that lands before the matching add
        counts.sub(DisposalState::ManagedUnreachable);
        assert_eq!(counts.get(DisposalState::ManagedUnreachable), 0);
        counts.add(DisposalState::ManagedUnreachable);
        assert_eq!(counts.get(DisposalState::ManagedUnreachable), 0);
        counts.add(DisposalState::ManagedUnreachable);
        assert_eq!(counts.get(DisposalState::ManagedUnreachable), 1);
    }

    #[test]
    fn test_free_stale_id() {
        let table: Arc<HandleTable<u8>> = HandleTable::new();
        let stale = SlotId::new(3, 9);
        assert_eq!(table.free(stale), Err(GcError::NotFound(stale)));
    }

    #[test]
    fn test_close() {
        let table = HandleTable::new();
        let a = table.acquire(None, || 1u8).unwrap();
        let observers = table.close();
        assert_eq!(observers.len(), 1);
        drop(a);
        assert!(table.queue().is_empty());
        assert_eq!(table.counts().total, 0);
    }
}

//! Disposal queue
//!
//! Ordered worklist of slots whose last strong handle has been dropped.
//! Each id is present at most once. Removal is lazy: the FIFO keeps stale
//! positions that `pop` skips, and compacts them when they pile up.

use crate::slot::SlotId;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct QueueInner {
    order: VecDeque<SlotId>,
    members: FxHashSet<SlotId>,
}

impl QueueInner {
    fn compact(&mut self) {
        if self.order.len() <= self.members.len() * 2 + 32 {
            return;
        }
        let mut seen = FxHashSet::default();
        let members = &self.members;
        self.order
            .retain(|id| members.contains(id) && seen.insert(*id));
    }
}

/// Set-like FIFO of slots awaiting the reaper
pub struct DisposalQueue {
    inner: Mutex<QueueInner>,
    pending: AtomicUsize,
}

impl DisposalQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue `id`; returns false if it is already queued
    pub fn push(&self, id: SlotId) -> bool {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, id)
    }

    /// Make sure `id` is queued when `admit` agrees; returns `admit`'s answer.
    ///
    /// `admit` runs with the queue locked even when `id` is already queued,
    /// so a state change made inside it is atomic with respect to `pop` and
    /// `remove_if`.
    pub fn push_if(&self, id: SlotId, admit: impl FnOnce() -> bool) -> bool {
        let mut inner = self.inner.lock();
        if !admit() {
            return false;
        }
        self.insert_locked(&mut inner, id);
        true
    }

    fn insert_locked(&self, inner: &mut QueueInner, id: SlotId) -> bool {
        if !inner.members.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        self.pending.fetch_add(1, Ordering::Release);
        true
    }

    /// Take the oldest queued id
    pub fn pop(&self) -> Option<SlotId> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.order.pop_front() {
            if inner.members.remove(&id) {
                self.pending.fetch_sub(1, Ordering::Release);
                return Some(id);
            }
        }
        None
    }

    /// Drop `id` from the queue when `remove` agrees
    pub fn remove_if(&self, id: SlotId, remove: impl FnOnce() -> bool) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.contains(&id) || !remove() {
            return false;
        }
        inner.members.remove(&id);
        self.pending.fetch_sub(1, Ordering::Release);
        inner.compact();
        true
    }

    /// Drop `id` from the queue
    pub fn remove(&self, id: SlotId) -> bool {
        self.remove_if(id, || true)
    }

    /// Whether `id` is queued
    pub fn contains(&self, id: SlotId) -> bool {
        self.inner.lock().members.contains(&id)
    }

    /// Number of queued ids
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock-free check used by the reaper between steps
    pub fn has_pending(&self) -> bool {
        !self.is_empty()
    }

    /// Queued ids, oldest first
    pub fn snapshot(&self) -> Vec<SlotId> {
        let inner = self.inner.lock();
        let mut seen = FxHashSet::default();
        inner
            .order
            .iter()
            .filter(|id| inner.members.contains(*id) && seen.insert(**id))
            .copied()
            .collect()
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.members.clear();
        self.pending.store(0, Ordering::Release);
    }
}

impl Default for DisposalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DisposalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposalQueue")
            .field("pending", &self.len())
            .finish()
    }
}

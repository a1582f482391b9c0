//! Weak observers and strong handle groups
//!
//! Every tracked entry owns one [`WeakObserver`]. The observer keeps the
//! tracked value alive as a strong fallback and watches the current group of
//! [`Strong`] handles through a `Weak`. When the last handle of a group is
//! dropped, the table is told the entry may be unreachable; a later request
//! for the same entry binds a new group (resurrection) as long as the native
//! side has not been told to weaken its reference yet.

use crate::error::{GcError, GcResult};
use crate::slot::{DisposalState, SlotId, StateCell};
use crate::table::HandleTable;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// How a strong handle was obtained from an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revival {
    /// Joined a group that was still alive
    Existing,
    /// Started a new group on an entry that never left `Active`
    Rebound,
    /// Pulled the entry back from `ManagedUnreachable`
    Resurrected,
}

struct Liveness<T: Send + Sync + 'static> {
    group: Weak<StrongInner<T>>,
    /// Bumped for every new group; drops from older groups are ignored
    epoch: u64,
}

/// Per-slot liveness tracker
pub struct WeakObserver<T: Send + Sync + 'static> {
    id: SlotId,
    key: Option<u64>,
    target: Arc<T>,
    state: StateCell,
    live: Mutex<Liveness<T>>,
}

impl<T: Send + Sync + 'static> WeakObserver<T> {
    pub(crate) fn new(id: SlotId, key: Option<u64>, target: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            target: Arc::new(target),
            state: StateCell::new(DisposalState::Active),
            live: Mutex::new(Liveness {
                group: Weak::new(),
                epoch: 0,
            }),
        })
    }

    /// Slot this observer lives in
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Identity the entry is indexed under, if any
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    /// The tracked value
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// Current lifecycle state
    pub fn state(&self) -> DisposalState {
        self.state.load()
    }

    /// True once no strong handle is held on the managed side
    pub fn is_collectible(&self) -> bool {
        self.live.lock().group.strong_count() == 0
    }

    /// Number of live strong handles
    pub fn managed_refs(&self) -> usize {
        self.live.lock().group.strong_count()
    }

    pub(crate) fn transition(
        &self,
        from: DisposalState,
        to: DisposalState,
    ) -> Result<(), DisposalState> {
        self.state.transition(from, to)
    }

    /// Produce a strong handle, reviving the entry if needed
    pub(crate) fn strengthen(
        self: &Arc<Self>,
        table: &Weak<HandleTable<T>>,
    ) -> GcResult<(Strong<T>, Revival)> {
        let mut live = self.live.lock();
        if let Some(inner) = live.group.upgrade() {
            return Ok((Strong { inner }, Revival::Existing));
        }

        let revival = match self.state.load() {
            DisposalState::Active => Revival::Rebound,
            DisposalState::ManagedUnreachable => self
                .state
                .transition(DisposalState::ManagedUnreachable, DisposalState::Active)
                .map(|_| Revival::Resurrected)
                .map_err(|state| GcError::NotResurrectable { id: self.id, state })?,
            state => return Err(GcError::NotResurrectable { id: self.id, state }),
        };

        live.epoch += 1;
        let inner = Arc::new(StrongInner {
            observer: Arc::clone(self),
            epoch: live.epoch,
            table: table.clone(),
        });
        live.group = Arc::downgrade(&inner);
        Ok((Strong { inner }, revival))
    }

    /// Move `Active -> ManagedUnreachable` if the group for `epoch` is
    /// still the current one and nothing rebound it meanwhile
    pub(crate) fn mark_unreachable(&self, epoch: u64) -> bool {
        let live = self.live.lock();
        if live.epoch != epoch || live.group.strong_count() != 0 {
            return false;
        }
        self.state
            .transition(DisposalState::Active, DisposalState::ManagedUnreachable)
            .is_ok()
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for WeakObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObserver")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct StrongInner<T: Send + Sync + 'static> {
    observer: Arc<WeakObserver<T>>,
    epoch: u64,
    table: Weak<HandleTable<T>>,
}

impl<T: Send + Sync + 'static> Drop for StrongInner<T> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.on_unreachable(&self.observer, self.epoch);
        }
    }
}

/// Strong reference to a tracked entry.
///
/// Clones share one group; the entry becomes eligible for reclamation when
/// the whole group is gone.
pub struct Strong<T: Send + Sync + 'static> {
    inner: Arc<StrongInner<T>>,
}

impl<T: Send + Sync + 'static> Strong<T> {
    /// Slot of the referenced entry
    pub fn id(&self) -> SlotId {
        self.inner.observer.id
    }

    /// Observer of the referenced entry
    pub fn observer(&self) -> &Arc<WeakObserver<T>> {
        &self.inner.observer
    }

    /// Lifecycle state of the referenced entry
    pub fn state(&self) -> DisposalState {
        self.inner.observer.state()
    }

    /// Clones alive in this group
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same entry
    pub fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.observer, &other.inner.observer)
    }
}

impl<T: Send + Sync + 'static> Clone for Strong<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.observer.target
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strong")
            .field("id", &self.id())
            .field("value", &**self)
            .finish()
    }
}

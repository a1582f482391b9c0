//! Object wrapper registry
//!
//! Keeps at most one managed-side wrapper per native object. Wrappers follow
//! the same lifecycle as handles, but are keyed by the native identity so
//! the registry can be consulted before building a second representation of
//! an object that already has one.

use crate::engine::NativeRef;
use crate::error::{BridgeError, BridgeResult};
use crate::stats::TrackedCounts;
use std::any::{Any, type_name};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tether_gc::{DisposalState, GcError, HandleTable, SlotId, Strong};

/// Tracked state behind a wrapper
pub struct ObjectRecord {
    pub(crate) native: NativeRef,
    type_name: &'static str,
    wrapper: Arc<dyn Any + Send + Sync>,
}

impl ObjectRecord {
    fn new<W: Any + Send + Sync>(native: NativeRef, wrapper: W) -> Self {
        Self {
            native,
            type_name: type_name::<W>(),
            wrapper: Arc::new(wrapper),
        }
    }
}

impl fmt::Debug for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("native", &self.native)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Typed strong reference to a registered wrapper
pub struct ObjectRef<W> {
    wrapper: Arc<W>,
    strong: Strong<ObjectRecord>,
}

impl<W> ObjectRef<W> {
    /// Slot of the wrapper entry
    pub fn id(&self) -> SlotId {
        self.strong.id()
    }

    /// Native object the wrapper represents
    pub fn native(&self) -> NativeRef {
        self.strong.native
    }

    /// Lifecycle state of the entry
    pub fn state(&self) -> DisposalState {
        self.strong.state()
    }

    /// Shared pointer to the wrapper itself
    pub fn wrapper(&self) -> &Arc<W> {
        &self.wrapper
    }

    /// Whether both refer to the same registration
    pub fn same_entry(&self, other: &Self) -> bool {
        self.strong.same_entry(&other.strong)
    }
}

impl<W> Clone for ObjectRef<W> {
    fn clone(&self) -> Self {
        Self {
            wrapper: Arc::clone(&self.wrapper),
            strong: self.strong.clone(),
        }
    }
}

impl<W> Deref for ObjectRef<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.wrapper
    }
}

impl<W: fmt::Debug> fmt::Debug for ObjectRef<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id())
            .field("native", &self.native())
            .field("wrapper", &*self.wrapper)
            .finish()
    }
}

fn typed<W: Any + Send + Sync>(strong: Strong<ObjectRecord>) -> BridgeResult<ObjectRef<W>> {
    match Arc::clone(&strong.wrapper).downcast::<W>() {
        Ok(wrapper) => Ok(ObjectRef { wrapper, strong }),
        Err(_) => Err(BridgeError::WrapperTypeMismatch {
            id: strong.id(),
            expected: type_name::<W>(),
            actual: strong.type_name,
        }),
    }
}

/// Index of managed-side wrappers by native identity
#[derive(Clone)]
pub struct ObjectRegistry {
    table: Arc<HandleTable<ObjectRecord>>,
}

impl ObjectRegistry {
    pub(crate) fn new(table: Arc<HandleTable<ObjectRecord>>) -> Self {
        Self { table }
    }

    /// Register `wrapper` as the representation of `native`.
    ///
    /// Registering a second wrapper while the first is still live is an
    /// invariant violation.
    pub fn register<W: Any + Send + Sync>(
        &self,
        native: NativeRef,
        wrapper: W,
    ) -> BridgeResult<ObjectRef<W>> {
        let strong = self
            .table
            .insert_unique(native.id(), || ObjectRecord::new(native, wrapper))?;
        tracing::trace!(slot = %strong.id(), %native, "wrapper registered");
        typed(strong)
    }

    /// Wrapper registered for `native`, if it is still live
    pub fn get<W: Any + Send + Sync>(&self, native: NativeRef) -> BridgeResult<Option<ObjectRef<W>>> {
        self.table.find(native.id()).map(typed).transpose()
    }

    /// Wrapper registered for `native`, creating it when there is none
    pub fn get_or_create<W: Any + Send + Sync>(
        &self,
        native: NativeRef,
        create: impl FnOnce() -> W,
    ) -> BridgeResult<ObjectRef<W>> {
        let strong = self
            .table
            .acquire(Some(native.id()), || ObjectRecord::new(native, create()))?;
        typed(strong)
    }

    /// Wrapper stored at `id`, if it can still be revived
    pub fn get_by_id<W: Any + Send + Sync>(&self, id: SlotId) -> BridgeResult<Option<ObjectRef<W>>> {
        match self.table.resurrect(id) {
            Ok(strong) => typed(strong).map(Some),
            Err(GcError::NotFound(_) | GcError::NotResurrectable { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Slot registered for `native`
    pub fn lookup(&self, native: NativeRef) -> Option<SlotId> {
        self.table.lookup(native.id())
    }

    /// Lifecycle state of `id`
    pub fn state(&self, id: SlotId) -> Option<DisposalState> {
        self.table.state(id)
    }

    /// Free a reclaimed wrapper slot
    pub fn release(&self, id: SlotId) -> BridgeResult<()> {
        Ok(self.table.free(id)?)
    }

    /// Wrapper slots currently in `state`
    pub fn objects_in_state(&self, state: DisposalState) -> Vec<SlotId> {
        self.table.ids_in_state(state)
    }

    /// Counters of the wrapper index
    pub fn counts(&self) -> TrackedCounts {
        self.table.counts().into()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("counts", &self.counts())
            .finish()
    }
}

//! Handles to engine values
//!
//! A [`Handle`] is cheap to clone and to drop. While any clone is alive the
//! entry stays `Active`; dropping the last clone queues the entry for the
//! reaper, and a later lookup can still revive it until the engine has been
//! told to weaken its reference.

use crate::engine::NativeRef;
use crate::value::HandleValue;
use std::fmt;
use tether_gc::{DisposalState, SlotId, Strong};

/// Tracked state behind a handle
#[derive(Debug)]
pub struct HandleRecord {
    pub(crate) native: NativeRef,
    pub(crate) value: HandleValue,
    /// The bridge created the native reference and must destroy it
    pub(crate) owned: bool,
}

impl HandleRecord {
    pub(crate) fn new(native: NativeRef, value: HandleValue, owned: bool) -> Self {
        Self {
            native,
            value,
            owned,
        }
    }
}

/// Strong reference to a value owned by the engine
#[derive(Clone)]
pub struct Handle {
    strong: Strong<HandleRecord>,
}

impl Handle {
    pub(crate) fn new(strong: Strong<HandleRecord>) -> Self {
        Self { strong }
    }

    /// Slot identity of this handle
    pub fn id(&self) -> SlotId {
        self.strong.id()
    }

    /// Engine identity the handle refers to
    pub fn native(&self) -> NativeRef {
        self.strong.native
    }

    /// Value captured when the handle was created
    pub fn value(&self) -> &HandleValue {
        &self.strong.value
    }

    /// Lifecycle state of the entry; `Active` while this handle lives
    pub fn state(&self) -> DisposalState {
        self.strong.state()
    }

    /// Clones of this handle currently alive
    pub fn ref_count(&self) -> usize {
        self.strong.ref_count()
    }

    /// True when the value is an object
    pub fn is_object(&self) -> bool {
        self.strong.value.is_object()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.strong.same_entry(&other.strong)
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field("native", &self.native())
            .field("value", self.value())
            .finish()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.value(), f)
    }
}

//! # Tether Bridge
//!
//! Lets a managed host hold references into objects owned by an embedded,
//! independently collected script engine without either side freeing what
//! the other still uses.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_bridge::{HandleBridge, HandleValue};
//!
//! let bridge = HandleBridge::builder()
//!     .initial_capacity(256)
//!     .build(Arc::new(MyEngine::new()))?;
//!
//! let handle = bridge.acquire_handle(HandleValue::from("hello"))?;
//! println!("{} lives at slot {}", handle, handle.id());
//! ```
//!
//! ## Lifecycle
//!
//! Every entry moves through `Active -> ManagedUnreachable -> NativeWeak ->
//! Disposed`. Dropping the last [`Handle`] queues the entry; the background
//! reaper asks the engine to weaken it; the engine reports reclamation via
//! [`HandleBridge::native_reclaimed`]; the slot is then reused.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod registry;
pub mod stats;
pub mod value;

pub use bridge::{BridgeBuilder, HandleBridge, ReclaimPause};
pub use config::BridgeConfig;
pub use engine::{EngineError, NativeEngine, NativeRef, TrackedKind, WeakToken};
pub use error::{BridgeError, BridgeResult};
pub use handle::{Handle, HandleRecord};
pub use registry::{ObjectRecord, ObjectRef, ObjectRegistry};
pub use stats::{BridgeStats, ReclaimStats, ReclaimStatsSnapshot, TrackedCounts};
pub use value::{ErrorKind, HandleSource, HandleValue, ObjectKind};

// Lifecycle types callers need alongside the bridge
pub use tether_gc::{DisposalState, PassReport, SlotId};

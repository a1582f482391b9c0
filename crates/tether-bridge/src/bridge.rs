//! Handle bridge
//!
//! Owns the handle table, the wrapper registry and the reaper that keeps
//! both in sync with the engine's collector.
//!
//! ## Example
//!
//! ```ignore
//! use tether_bridge::{HandleBridge, HandleValue, ObjectKind};
//!
//! let bridge = HandleBridge::new(engine)?;
//! let handle = bridge.acquire_handle(HandleValue::Object(ObjectKind::Array))?;
//! let id = handle.id();
//!
//! // Same entry while any handle to it is alive
//! assert_eq!(bridge.get_handle(id), Some(handle.clone()));
//!
//! // Dropping the last handle queues the entry for the reaper
//! drop(handle);
//! ```

use crate::config::BridgeConfig;
use crate::engine::{NativeEngine, NativeRef, TrackedKind, WeakToken};
use crate::error::BridgeResult;
use crate::handle::{Handle, HandleRecord};
use crate::registry::{ObjectRecord, ObjectRegistry};
use crate::stats::{BridgeStats, ReclaimStats};
use crate::value::HandleSource;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use scopeguard::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tether_gc::{
    DisposalState, GcError, HandleTable, PassReport, ReapFault, Reaper, Reaping, ReclaimWork,
    SlotId, StepOutcome, run_pass,
};
use tracing::{debug, trace, warn};

/// Entries that carry a native identity
trait NativeBacked {
    fn native(&self) -> NativeRef;
}

impl NativeBacked for HandleRecord {
    fn native(&self) -> NativeRef {
        self.native
    }
}

impl NativeBacked for ObjectRecord {
    fn native(&self) -> NativeRef {
        self.native
    }
}

/// State shared by the bridge and its reaper
struct BridgeCore {
    engine: Arc<dyn NativeEngine>,
    handles: Arc<HandleTable<HandleRecord>>,
    objects: Arc<HandleTable<ObjectRecord>>,
    /// Entries the engine refused to weaken, waiting for a retry
    abandoned: Mutex<Vec<WeakToken>>,
    stats: ReclaimStats,
    ticks: AtomicU64,
    /// Next step goes to the object table when both have work
    objects_turn: AtomicBool,
    config: BridgeConfig,
}

impl BridgeCore {
    fn reap<T: NativeBacked + Send + Sync + 'static>(
        &self,
        kind: TrackedKind,
        table: &HandleTable<T>,
    ) -> Result<StepOutcome, ReapFault> {
        let observer = match table.begin_reap() {
            None => return Ok(StepOutcome::Idle),
            Some(Reaping::Skipped(id)) => return Ok(StepOutcome::Skipped(id)),
            Some(Reaping::Ready(observer)) => observer,
        };

        let id = observer.id();
        let native = observer.target().native();
        let token = WeakToken { kind, slot: id };
        // back to ManagedUnreachable unless the engine took the entry,
        // including when mark_weak unwinds
        let refused = scopeguard::guard(token, |token| {
            table.revert_native_weak(&observer);
            self.abandoned.lock().push(token);
        });
        match self.engine.mark_weak(native, token) {
            Ok(()) => {
                ScopeGuard::into_inner(refused);
                ReclaimStats::bump(&self.stats.marked_weak);
                trace!(slot = %id, %native, ?kind, "marked weak");
                Ok(StepOutcome::Processed(id))
            }
            Err(e) => Err(ReapFault::new(Some(id), e.to_string())),
        }
    }

    fn retry_abandoned(&self) {
        let tokens = std::mem::take(&mut *self.abandoned.lock());
        if tokens.is_empty() {
            return;
        }
        let mut requeued = 0;
        for token in &tokens {
            let queued = match token.kind {
                TrackedKind::Handle => self.handles.requeue(token.slot),
                TrackedKind::Object => self.objects.requeue(token.slot),
            };
            if queued {
                requeued += 1;
                ReclaimStats::bump(&self.stats.retried);
            }
        }
        debug!(abandoned = tokens.len(), requeued, "retried refused entries");
    }

    fn poll_table<T: NativeBacked + Send + Sync + 'static>(&self, table: &HandleTable<T>) {
        for id in table.ids_in_state(DisposalState::NativeWeak) {
            let Some(observer) = table.observer(id) else {
                continue;
            };
            let native = observer.target().native();
            if self.engine.native_state(native) == Some(DisposalState::Disposed) {
                match table.confirm_reclaimed(id) {
                    Ok(true) => ReclaimStats::bump(&self.stats.reclaimed),
                    Ok(false) => {}
                    Err(e) => warn!(slot = %id, error = %e, "polled reclaim rejected"),
                }
            }
        }
    }

    fn table_confirm(&self, token: WeakToken) -> Result<bool, GcError> {
        match token.kind {
            TrackedKind::Handle => self.handles.confirm_reclaimed(token.slot),
            TrackedKind::Object => self.objects.confirm_reclaimed(token.slot),
        }
    }

    /// Give every native reference the bridge created back to the engine.
    ///
    /// Wrapped objects and handles to engine objects are left alone, and
    /// each native is destroyed at most once.
    fn release_all(&self) {
        let mut destroyed = FxHashSet::default();
        for observer in self.handles.close() {
            let record = observer.target();
            if record.owned
                && observer.state() != DisposalState::Disposed
                && destroyed.insert(record.native)
            {
                self.engine.destroy_native_reference(record.native);
            }
        }
        let wrappers = self.objects.close().len();
        debug!(
            destroyed = destroyed.len(),
            wrappers, "bridge released native references"
        );
    }
}

impl ReclaimWork for BridgeCore {
    fn has_pending(&self) -> bool {
        self.handles.queue().has_pending() || self.objects.queue().has_pending()
    }

    fn step(&self) -> Result<StepOutcome, ReapFault> {
        let handles = self.handles.queue().has_pending();
        let objects = self.objects.queue().has_pending();
        let objects_turn = self.objects_turn.fetch_xor(true, Ordering::Relaxed);
        if objects && (objects_turn || !handles) {
            self.reap(TrackedKind::Object, &self.objects)
        } else {
            self.reap(TrackedKind::Handle, &self.handles)
        }
    }

    fn idle_notification(&self, budget_ms: u64) {
        ReclaimStats::bump(&self.stats.idle_notifications);
        self.engine.idle_notification(budget_ms);
    }

    fn on_idle_tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % self.config.abandoned_retry_ticks.max(1) == 0 {
            self.retry_abandoned();
        }
        if self.config.poll_native_state {
            self.poll_table(&self.handles);
            self.poll_table(&self.objects);
        }
    }

    fn on_fault(&self, _fault: &ReapFault) {
        ReclaimStats::bump(&self.stats.faults);
    }
}

/// Builder for [`HandleBridge`]
#[derive(Debug, Clone, Default)]
pub struct BridgeBuilder {
    config: BridgeConfig,
}

impl BridgeBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial slot capacity of each table
    ///
    /// Default is 1000.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.initial_capacity(capacity);
        self
    }

    /// Run the reaper on a background thread
    ///
    /// When disabled, reclamation only happens through
    /// [`HandleBridge::reclaim_pass`].
    pub fn background_reclaim(mut self, enabled: bool) -> Self {
        self.config = self.config.background_reclaim(enabled);
        self
    }

    /// Set the reaper sleep between passes
    pub fn reaper_interval(mut self, interval: std::time::Duration) -> Self {
        self.config = self.config.reaper_interval(interval);
        self
    }

    /// Poll the engine for reclaimed entries on each idle tick
    pub fn poll_native_state(mut self, enabled: bool) -> Self {
        self.config = self.config.poll_native_state(enabled);
        self
    }

    /// Set how many idle ticks pass between retries of refused entries
    pub fn abandoned_retry_ticks(mut self, ticks: u64) -> Self {
        self.config = self.config.abandoned_retry_ticks(ticks);
        self
    }

    /// Build the bridge over `engine`
    pub fn build(self, engine: Arc<dyn NativeEngine>) -> BridgeResult<HandleBridge> {
        let config = self.config;
        let core = Arc::new(BridgeCore {
            engine,
            handles: HandleTable::with_capacity(config.initial_capacity),
            objects: HandleTable::with_capacity(config.initial_capacity),
            abandoned: Mutex::new(Vec::new()),
            stats: ReclaimStats::default(),
            ticks: AtomicU64::new(0),
            objects_turn: AtomicBool::new(false),
            config: config.clone(),
        });

        let reaper = if config.background_reclaim {
            let reaper = Reaper::spawn(core.clone(), config.reaper_config())?;
            core.handles.set_waker(reaper.waker());
            core.objects.set_waker(reaper.waker());
            Some(reaper)
        } else {
            None
        };

        debug!(
            capacity = config.initial_capacity,
            background = config.background_reclaim,
            "handle bridge created"
        );

        Ok(HandleBridge {
            objects: ObjectRegistry::new(Arc::clone(&core.objects)),
            core,
            reaper,
        })
    }
}

/// Lifetime bridge between managed handles and engine-owned objects
pub struct HandleBridge {
    core: Arc<BridgeCore>,
    reaper: Option<Reaper>,
    objects: ObjectRegistry,
}

impl HandleBridge {
    /// Bridge with the default configuration
    pub fn new(engine: Arc<dyn NativeEngine>) -> BridgeResult<Self> {
        Self::builder().build(engine)
    }

    /// Start configuring a bridge
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Configuration in use
    pub fn config(&self) -> &BridgeConfig {
        &self.core.config
    }

    /// Handle for a native object or a fresh value.
    ///
    /// A native object that already has a live entry gets that entry back;
    /// otherwise a slot is allocated, reusing freed and reclaimed slots first.
    pub fn acquire_handle(&self, source: impl Into<HandleSource>) -> BridgeResult<Handle> {
        let core = &self.core;
        match source.into() {
            HandleSource::Native(native) => {
                if let Some(strong) = core.handles.find(native.id()) {
                    return Ok(Handle::new(strong));
                }
                let value = core.engine.describe(native)?;
                let strong = core
                    .handles
                    .acquire(Some(native.id()), || HandleRecord::new(native, value, false))?;
                Ok(Handle::new(strong))
            }
            HandleSource::Value(value) => {
                let native = core.engine.create_native_reference(&value)?;
                match core
                    .handles
                    .acquire(Some(native.id()), || HandleRecord::new(native, value, true))
                {
                    Ok(strong) => Ok(Handle::new(strong)),
                    Err(e) => {
                        core.engine.destroy_native_reference(native);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Handle for `id`, reviving the entry if the reaper has not reached it.
    ///
    /// Returns `None` for stale ids and for entries already handed to the
    /// engine's collector.
    pub fn get_handle(&self, id: SlotId) -> Option<Handle> {
        self.core.handles.resurrect(id).ok().map(Handle::new)
    }

    /// Free the slot of a reclaimed handle.
    ///
    /// Only `Disposed` entries may be released; anything else is an
    /// invariant violation.
    pub fn release_handle(&self, id: SlotId) -> BridgeResult<()> {
        Ok(self.core.handles.free(id)?)
    }

    /// Lifecycle state of a handle entry
    pub fn handle_state(&self, id: SlotId) -> Option<DisposalState> {
        self.core.handles.state(id)
    }

    /// Called by the engine once its collector reclaimed a weak object.
    ///
    /// Reporting an entry that is already recorded as reclaimed, for
    /// example after a native state poll saw it first, is a no-op.
    pub fn native_reclaimed(&self, token: WeakToken) -> BridgeResult<()> {
        if self.core.table_confirm(token)? {
            ReclaimStats::bump(&self.core.stats.reclaimed);
        }
        Ok(())
    }

    /// Wrapper registry keyed by native identity
    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// Occupied handle slots in any state
    pub fn total_handles(&self) -> usize {
        self.core.handles.len()
    }

    /// Handles waiting for the reaper
    pub fn total_pending_disposal(&self) -> usize {
        self.core.handles.count(DisposalState::ManagedUnreachable)
    }

    /// Reclaimed handle slots ready for reuse
    pub fn total_cached(&self) -> usize {
        self.core.handles.count(DisposalState::Disposed)
    }

    /// Handle slots currently in `state`
    pub fn handles_in_state(&self, state: DisposalState) -> Vec<SlotId> {
        self.core.handles.ids_in_state(state)
    }

    /// Handle slots queued for the reaper, oldest first
    pub fn disposal_queue(&self) -> Vec<SlotId> {
        self.core.handles.queue().snapshot()
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            handles: self.core.handles.counts().into(),
            objects: self.core.objects.counts().into(),
            reclaim: self.core.stats.snapshot(),
            abandoned: self.core.abandoned.lock().len(),
            reclaim_paused: self.is_reclaim_paused(),
        }
    }

    /// Park the background reaper at its next safe point.
    ///
    /// Returns once the reaper has acknowledged; counters stay stable until
    /// [`resume_background_reclaim`](Self::resume_background_reclaim),
    /// apart from changes made by the caller.
    pub fn pause_background_reclaim(&self) -> BridgeResult<()> {
        if let Some(reaper) = &self.reaper {
            reaper.pause()?;
            debug!("background reclaim paused");
        }
        Ok(())
    }

    /// Let a paused reaper continue
    pub fn resume_background_reclaim(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.resume();
            debug!("background reclaim resumed");
        }
    }

    /// Pause the reaper until the returned guard is dropped
    pub fn paused_reclaim(&self) -> BridgeResult<ReclaimPause<'_>> {
        self.pause_background_reclaim()?;
        Ok(ReclaimPause { bridge: self })
    }

    /// Whether the background reaper is parked
    pub fn is_reclaim_paused(&self) -> bool {
        self.reaper.as_ref().is_some_and(Reaper::is_paused)
    }

    /// Drain both queues on the calling thread
    pub fn reclaim_pass(&self) -> PassReport {
        run_pass(self.core.as_ref(), &self.core.config.reaper_config())
    }

    /// Stop the reaper and give all native references back to the engine
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for HandleBridge {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.shutdown();
        }
        self.core.release_all();
    }
}

impl std::fmt::Debug for HandleBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleBridge")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Keeps background reclamation paused while alive
#[must_use = "reclamation resumes as soon as the guard is dropped"]
pub struct ReclaimPause<'a> {
    bridge: &'a HandleBridge,
}

impl Drop for ReclaimPause<'_> {
    fn drop(&mut self) {
        self.bridge.resume_background_reclaim();
    }
}

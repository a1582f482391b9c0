//! In-memory engine used by the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_bridge::{
    DisposalState, EngineError, HandleBridge, HandleValue, NativeEngine, NativeRef, WeakToken,
};
use tracing_subscriber::filter::EnvFilter;

/// Route bridge logs to the test output; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
struct MockObject {
    value: HandleValue,
    weak: Option<WeakToken>,
    reclaimed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    objects: HashMap<u64, MockObject>,
    weak_requests: Vec<WeakToken>,
    destroyed: Vec<NativeRef>,
    idle_calls: usize,
    refuse_weak: bool,
    panic_on_idle: bool,
    panic_on_mark_weak: bool,
}

/// Engine whose collector only runs when a test calls [`MockEngine::collect`]
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an object owned by the engine, as script code would
    pub fn spawn_object(&self, value: HandleValue) -> NativeRef {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.objects.insert(
            id,
            MockObject {
                value,
                weak: None,
                reclaimed: false,
            },
        );
        NativeRef::new(id)
    }

    /// Reclaim every weak object; returns the tokens to report back
    pub fn collect(&self) -> Vec<WeakToken> {
        let mut state = self.state.lock();
        let mut tokens = Vec::new();
        for object in state.objects.values_mut() {
            if let (Some(token), false) = (object.weak, object.reclaimed) {
                object.reclaimed = true;
                tokens.push(token);
            }
        }
        tokens.sort_by_key(|token| token.slot);
        tokens
    }

    /// Collect and report every reclaimed object to `bridge`
    pub fn collect_into(&self, bridge: &HandleBridge) -> usize {
        let tokens = self.collect();
        for token in &tokens {
            bridge.native_reclaimed(*token).unwrap();
        }
        tokens.len()
    }

    pub fn refuse_weak(&self, refuse: bool) {
        self.state.lock().refuse_weak = refuse;
    }

    /// Make the next idle notification panic
    pub fn panic_on_next_idle(&self) {
        self.state.lock().panic_on_idle = true;
    }

    /// Make the next `mark_weak` call panic
    pub fn panic_on_next_mark_weak(&self) {
        self.state.lock().panic_on_mark_weak = true;
    }

    pub fn weak_requests(&self) -> Vec<WeakToken> {
        self.state.lock().weak_requests.clone()
    }

    pub fn destroyed(&self) -> Vec<NativeRef> {
        self.state.lock().destroyed.clone()
    }

    pub fn idle_calls(&self) -> usize {
        self.state.lock().idle_calls
    }

    pub fn live_objects(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| !object.reclaimed)
            .count()
    }
}

impl NativeEngine for MockEngine {
    fn create_native_reference(&self, value: &HandleValue) -> Result<NativeRef, EngineError> {
        Ok(self.spawn_object(value.clone()))
    }

    fn destroy_native_reference(&self, native: NativeRef) {
        let mut state = self.state.lock();
        state.objects.remove(&native.id());
        state.destroyed.push(native);
    }

    fn mark_weak(&self, native: NativeRef, token: WeakToken) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.panic_on_mark_weak) {
            drop(state);
            panic!("engine aborted mark_weak");
        }
        if state.refuse_weak {
            return Err(EngineError::Rejected("weak references disabled".into()));
        }
        let object = state
            .objects
            .get_mut(&native.id())
            .ok_or(EngineError::UnknownReference(native))?;
        object.weak = Some(token);
        state.weak_requests.push(token);
        Ok(())
    }

    fn idle_notification(&self, _budget_ms: u64) -> bool {
        let mut state = self.state.lock();
        state.idle_calls += 1;
        if std::mem::take(&mut state.panic_on_idle) {
            drop(state);
            panic!("engine aborted idle notification");
        }
        true
    }

    fn describe(&self, native: NativeRef) -> Result<HandleValue, EngineError> {
        self.state
            .lock()
            .objects
            .get(&native.id())
            .filter(|object| !object.reclaimed)
            .map(|object| object.value.clone())
            .ok_or(EngineError::UnknownReference(native))
    }

    fn native_state(&self, native: NativeRef) -> Option<DisposalState> {
        let state = self.state.lock();
        let object = state.objects.get(&native.id())?;
        Some(match (object.weak, object.reclaimed) {
            (_, true) => DisposalState::Disposed,
            (Some(_), false) => DisposalState::NativeWeak,
            (None, false) => DisposalState::Active,
        })
    }
}

/// Bridge without a background thread, driven by `reclaim_pass`
pub fn manual_bridge(engine: &Arc<MockEngine>) -> HandleBridge {
    init_tracing();
    HandleBridge::builder()
        .background_reclaim(false)
        .build(engine.clone())
        .unwrap()
}

/// Bridge with a fast background reaper
pub fn background_bridge(engine: &Arc<MockEngine>) -> HandleBridge {
    init_tracing();
    HandleBridge::builder()
        .reaper_interval(Duration::from_millis(5))
        .build(engine.clone())
        .unwrap()
}

/// Poll `done` for up to five seconds
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

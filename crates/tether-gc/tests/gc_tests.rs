//! Handle lifecycle tests
//!
//! These tests drive the handle table through full lifecycles, both by hand
//! and with the background reaper thread.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether_gc::{
    DisposalState, GcError, HandleTable, ReapFault, Reaper, ReaperConfig, ReaperState, Reaping,
    ReclaimWork, StepOutcome, Strong, run_pass,
};

/// Reclaim work over a single table that weakens entries without a native side
struct TableWork {
    table: Arc<HandleTable<u32>>,
    weakened: AtomicUsize,
    idles: AtomicUsize,
}

impl TableWork {
    fn new(table: Arc<HandleTable<u32>>) -> Arc<Self> {
        Arc::new(Self {
            table,
            weakened: AtomicUsize::new(0),
            idles: AtomicUsize::new(0),
        })
    }
}

impl ReclaimWork for TableWork {
    fn has_pending(&self) -> bool {
        self.table.queue().has_pending()
    }

    fn step(&self) -> Result<StepOutcome, ReapFault> {
        Ok(match self.table.begin_reap() {
            None => StepOutcome::Idle,
            Some(Reaping::Ready(observer)) => {
                self.weakened.fetch_add(1, Ordering::SeqCst);
                StepOutcome::Processed(observer.id())
            }
            Some(Reaping::Skipped(id)) => StepOutcome::Skipped(id),
        })
    }

    fn idle_notification(&self, _budget_ms: u64) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> ReaperConfig {
    ReaperConfig {
        interval: Duration::from_millis(5),
        thread_name: "tether-reaper-test".to_string(),
        ..ReaperConfig::default()
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_full_lifecycle_by_hand() {
    let table = HandleTable::new();
    let work = TableWork::new(Arc::clone(&table));

    let a = table.acquire(Some(100), || 100).unwrap();
    let b = table.acquire(Some(200), || 200).unwrap();
    assert_eq!(a.id().index(), 0);
    assert_eq!(b.id().index(), 1);

    let id_a = a.id();
    drop(a);
    assert_eq!(table.queue().snapshot(), vec![id_a]);

    let report = run_pass(work.as_ref(), &ReaperConfig::default());
    assert_eq!(report.processed, 1);
    assert_eq!(table.state(id_a), Some(DisposalState::NativeWeak));
    assert!(table.queue().is_empty());
    assert!(table.ids_in_state(DisposalState::ManagedUnreachable).is_empty());

    table.confirm_reclaimed(id_a).unwrap();
    assert_eq!(table.state(id_a), Some(DisposalState::Disposed));
    table.free(id_a).unwrap();
    assert_eq!(table.state(id_a), None);

    let c = table.acquire(Some(300), || 300).unwrap();
    assert_eq!(c.id().index(), 0);
    assert_ne!(c.id(), id_a);
    assert_eq!(*c, 300);
    drop(b);
}

#[test]
fn test_counts_follow_lifecycle() {
    let table = HandleTable::new();
    let handles: Vec<Strong<u32>> = (0..4)
        .map(|k| table.acquire(Some(k), || k as u32).unwrap())
        .collect();
    assert_eq!(table.counts().active, 4);

    drop(handles);
    let counts = table.counts();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.pending, 4);
    assert_eq!(counts.queued, 4);

    while table.begin_reap().is_some() {}
    assert_eq!(table.counts().native_weak, 4);

    for id in table.ids_in_state(DisposalState::NativeWeak) {
        table.confirm_reclaimed(id).unwrap();
    }
    let counts = table.counts();
    assert_eq!(counts.cached, 4);
    assert_eq!(counts.total, 4);
}

#[test]
fn test_double_registration_rejected() {
    let table = HandleTable::new();
    let _first = table.insert_unique(9, || 1u32).unwrap();
    let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        table.insert_unique(9, || 2u32)
    }));
    match second {
        Ok(result) => assert!(matches!(result, Err(GcError::InvariantViolation(_)))),
        Err(_) => assert!(cfg!(debug_assertions)),
    }
}

#[test]
fn test_reaper_thread_drains_queue() {
    let table = HandleTable::new();
    let work = TableWork::new(Arc::clone(&table));
    let reaper = Reaper::spawn(work.clone(), fast_config()).unwrap();
    table.set_waker(reaper.waker());

    let ids: Vec<_> = (0..16)
        .map(|k| table.acquire(Some(k), || k as u32).unwrap().id())
        .collect();

    assert!(wait_until(|| table.count(DisposalState::NativeWeak) == ids.len()));
    assert_eq!(work.weakened.load(Ordering::SeqCst), ids.len());
    assert!(work.idles.load(Ordering::SeqCst) > 0);

    reaper.shutdown();
    assert_eq!(reaper.state(), ReaperState::Stopped);
}

#[test]
fn test_pause_holds_entries() {
    let table = HandleTable::new();
    let work = TableWork::new(Arc::clone(&table));
    let reaper = Reaper::spawn(work, fast_config()).unwrap();
    table.set_waker(reaper.waker());

    reaper.pause().unwrap();
    assert!(reaper.is_paused());

    let id = table.acquire(Some(1), || 1).unwrap().id();
    let before = table.counts();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(table.counts(), before);
    assert_eq!(table.state(id), Some(DisposalState::ManagedUnreachable));

    reaper.resume();
    assert!(wait_until(|| table.state(id) == Some(DisposalState::NativeWeak)));
    assert!(!reaper.is_paused());
    assert_eq!(reaper.safepoint().pause_count(), 1);
}

#[test]
fn test_pause_after_shutdown() {
    let table = HandleTable::new();
    let reaper = Reaper::spawn(TableWork::new(table), fast_config()).unwrap();
    reaper.shutdown();
    reaper.shutdown();
    assert_eq!(reaper.pause(), Err(GcError::ReaperStopped));
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(u8),
    Release(usize),
    Reap,
    Reclaim,
    Free,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..16).prop_map(Op::Acquire),
        3 => any::<usize>().prop_map(Op::Release),
        1 => Just(Op::Reap),
        1 => Just(Op::Reclaim),
        1 => Just(Op::Free),
    ]
}

proptest! {
    #[test]
    fn prop_live_ids_unique(ops in prop::collection::vec(op(), 1..200)) {
        let table = HandleTable::with_capacity(4);
        let mut held: Vec<Strong<u32>> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(key) => match table.acquire(Some(key as u64), || key as u32) {
                    Ok(strong) => held.push(strong),
                    Err(GcError::NotResurrectable { id, state }) => {
                        prop_assert_eq!(state, DisposalState::NativeWeak);
                        prop_assert_eq!(table.lookup(key as u64), Some(id));
                    }
                    Err(e) => prop_assert!(false, "acquire failed: {e}"),
                },
                Op::Release(i) => {
                    if !held.is_empty() {
                        let i = i % held.len();
                        held.swap_remove(i);
                    }
                }
                Op::Reap => while table.begin_reap().is_some() {},
                Op::Reclaim => {
                    for id in table.ids_in_state(DisposalState::NativeWeak) {
                        table.confirm_reclaimed(id).unwrap();
                    }
                }
                Op::Free => {
                    for id in table.ids_in_state(DisposalState::Disposed) {
                        table.free(id).unwrap();
                    }
                }
            }

            let mut owners: HashMap<_, u32> = HashMap::new();
            for strong in &held {
                prop_assert_eq!(strong.state(), DisposalState::Active);
                let owner = *owners.entry(strong.id()).or_insert(**strong);
                prop_assert_eq!(owner, **strong);
            }
            prop_assert_eq!(table.count(DisposalState::Active), owners.len());
        }
    }
}

//! Background reaper
//!
//! A single thread drains pending entries one step at a time, yielding
//! between steps, and nudges the native collector with idle notifications.
//! Control messages (wake, pause, resume, shutdown) arrive on a channel and
//! are only handled between steps, so a pause never lands mid-transition.
//!
//! ## Loop
//!
//! 1. Handle queued control messages; a pause parks the thread until resumed
//! 2. While work is pending: one step, a short idle notification, yield
//! 3. Idle tick and a longer idle notification
//! 4. Sleep on the control channel for the configured interval

use crate::error::{GcError, GcResult, invariant_violation};
use crate::safepoint::{ReaperState, SafePoint};
use crate::slot::SlotId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info_span, trace, warn};

const CONTROL_CAPACITY: usize = 64;

/// What a single reclaim step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was pending
    Idle,
    /// The entry was handed to the native collector
    Processed(SlotId),
    /// The entry no longer needed processing
    Skipped(SlotId),
}

/// Failure inside one reclaim step.
///
/// The reaper logs it, reports it through [`ReclaimWork::on_fault`] and
/// moves on to the next entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("reclaim step failed: {reason}")]
pub struct ReapFault {
    /// Entry being processed, when known
    pub slot: Option<SlotId>,
    /// Human-readable cause
    pub reason: String,
}

impl ReapFault {
    /// Create a fault for `slot`
    pub fn new(slot: Option<SlotId>, reason: impl Into<String>) -> Self {
        Self {
            slot,
            reason: reason.into(),
        }
    }

    fn panicked(context: &str, payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("{context} panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("{context} panicked: {s}")
        } else {
            format!("{context} panicked: unknown payload")
        };
        Self::new(None, reason)
    }
}

/// Work the reaper performs
pub trait ReclaimWork: Send + Sync + 'static {
    /// Whether any entry is waiting
    fn has_pending(&self) -> bool;

    /// Process exactly one pending entry
    fn step(&self) -> Result<StepOutcome, ReapFault>;

    /// Give the native collector up to `budget_ms` of spare time
    fn idle_notification(&self, budget_ms: u64);

    /// Called once per pass after the queue is drained
    fn on_idle_tick(&self) {}

    /// Called for every failed or panicking step or idle hook
    fn on_fault(&self, _fault: &ReapFault) {}
}

/// Reaper tuning
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Sleep between passes when there is nothing to do
    pub interval: Duration,
    /// Idle notification budget after a pass
    pub idle_budget_ms: u64,
    /// Idle notification budget after each step
    pub step_budget_ms: u64,
    /// Name of the background thread
    pub thread_name: String,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            idle_budget_ms: 100,
            step_budget_ms: 1,
            thread_name: "tether-reaper".to_string(),
        }
    }
}

/// Totals of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Entries handed to the native collector
    pub processed: usize,
    /// Entries that were resurrected or gone
    pub skipped: usize,
    /// Steps that failed
    pub faults: usize,
}

impl PassReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run one step; false when there was nothing to do
fn run_step(work: &dyn ReclaimWork, report: &mut PassReport) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| work.step()))
        .unwrap_or_else(|payload| Err(ReapFault::panicked("step", payload)));
    match result {
        Ok(StepOutcome::Processed(_)) => report.processed += 1,
        Ok(StepOutcome::Skipped(_)) => report.skipped += 1,
        Ok(StepOutcome::Idle) => return false,
        Err(fault) => {
            report.faults += 1;
            warn!(slot = ?fault.slot, error = %fault, "reclaim step failed, skipping entry");
            work.on_fault(&fault);
        }
    }
    true
}

/// Run an idle hook; a panic is reported like a failed step
fn run_hook(
    work: &dyn ReclaimWork,
    context: &str,
    report: &mut PassReport,
    hook: impl FnOnce(&dyn ReclaimWork),
) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(work))) {
        let fault = ReapFault::panicked(context, payload);
        report.faults += 1;
        warn!(error = %fault, "reaper hook failed");
        work.on_fault(&fault);
    }
}

fn idle_tick(work: &dyn ReclaimWork, budget_ms: u64, report: &mut PassReport) {
    run_hook(work, "idle tick", report, |work| work.on_idle_tick());
    run_hook(work, "idle notification", report, |work| {
        work.idle_notification(budget_ms)
    });
}

/// Drain all pending work on the calling thread, then run the idle tick
pub fn run_pass(work: &dyn ReclaimWork, config: &ReaperConfig) -> PassReport {
    let mut report = PassReport::default();
    while work.has_pending() {
        if !run_step(work, &mut report) {
            break;
        }
        run_hook(work, "idle notification", &mut report, |work| {
            work.idle_notification(config.step_budget_ms)
        });
    }
    idle_tick(work, config.idle_budget_ms, &mut report);
    report
}

enum ReaperMessage {
    Wake,
    Pause { ack: Sender<()> },
    Resume,
    Shutdown,
}

/// Cheap handle used to wake the reaper when work is queued
#[derive(Clone)]
pub struct ReaperWaker {
    tx: Sender<ReaperMessage>,
}

impl ReaperWaker {
    /// Ask the reaper to start a pass early. Never blocks.
    pub fn wake(&self) {
        let _ = self.tx.try_send(ReaperMessage::Wake);
    }
}

impl fmt::Debug for ReaperWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaperWaker").finish_non_exhaustive()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct ReaperLoop {
    work: Arc<dyn ReclaimWork>,
    rx: Receiver<ReaperMessage>,
    safepoint: Arc<SafePoint>,
    config: ReaperConfig,
}

impl ReaperLoop {
    fn run(self) {
        let _span = info_span!("reaper", name = %self.config.thread_name).entered();
        let safepoint = Arc::clone(&self.safepoint);
        let _stopped = scopeguard::guard((), move |_| safepoint.mark_stopped());
        debug!("reaper started");

        loop {
            if let Flow::Stop = self.drain() {
                break;
            }
            idle_tick(
                self.work.as_ref(),
                self.config.idle_budget_ms,
                &mut PassReport::default(),
            );

            let flow = match self.rx.recv_timeout(self.config.interval) {
                Ok(message) => self.handle(message),
                Err(RecvTimeoutError::Timeout) => Flow::Continue,
                Err(RecvTimeoutError::Disconnected) => Flow::Stop,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        debug!("reaper stopped");
    }

    fn drain(&self) -> Flow {
        if let Flow::Stop = self.poll_control() {
            return Flow::Stop;
        }

        let mut report = PassReport::default();
        while self.work.has_pending() {
            if !run_step(self.work.as_ref(), &mut report) {
                break;
            }
            run_hook(
                self.work.as_ref(),
                "idle notification",
                &mut report,
                |work| work.idle_notification(self.config.step_budget_ms),
            );
            thread::yield_now();
            if let Flow::Stop = self.poll_control() {
                return Flow::Stop;
            }
        }

        if !report.is_empty() {
            trace!(
                processed = report.processed,
                skipped = report.skipped,
                faults = report.faults,
                "drain finished"
            );
        }
        Flow::Continue
    }

    fn poll_control(&self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if let Flow::Stop = self.handle(message) {
                        return Flow::Stop;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn handle(&self, message: ReaperMessage) -> Flow {
        match message {
            ReaperMessage::Wake | ReaperMessage::Resume => Flow::Continue,
            ReaperMessage::Pause { ack } => self.park(ack),
            ReaperMessage::Shutdown => Flow::Stop,
        }
    }

    fn park(&self, ack: Sender<()>) -> Flow {
        self.safepoint.enter_paused();
        debug!("reaper paused");
        let _ = ack.send(());

        let flow = loop {
            match self.rx.recv() {
                Ok(ReaperMessage::Resume) => break Flow::Continue,
                Ok(ReaperMessage::Pause { ack }) => {
                    let _ = ack.send(());
                }
                Ok(ReaperMessage::Wake) => {}
                Ok(ReaperMessage::Shutdown) | Err(_) => break Flow::Stop,
            }
        };

        self.safepoint.leave_paused();
        debug!("reaper resumed");
        flow
    }
}

/// Owner of the background reaper thread
pub struct Reaper {
    tx: Sender<ReaperMessage>,
    safepoint: Arc<SafePoint>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl Reaper {
    /// Start the reaper thread for `work`
    pub fn spawn(work: Arc<dyn ReclaimWork>, config: ReaperConfig) -> GcResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded(CONTROL_CAPACITY);
        let safepoint = Arc::new(SafePoint::new());
        let name = config.thread_name.clone();

        let reaper_loop = ReaperLoop {
            work,
            rx,
            safepoint: Arc::clone(&safepoint),
            config,
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reaper_loop.run())
            .map_err(|e| GcError::Spawn(e.to_string()))?;
        let thread_id = handle.thread().id();
        debug!(name = %name, "reaper spawned");

        Ok(Self {
            tx,
            safepoint,
            thread: Mutex::new(Some(handle)),
            thread_id,
            name,
        })
    }

    /// Waker to hand to the tables feeding this reaper
    pub fn waker(&self) -> ReaperWaker {
        ReaperWaker {
            tx: self.tx.clone(),
        }
    }

    /// Start a pass early
    pub fn wake(&self) {
        let _ = self.tx.try_send(ReaperMessage::Wake);
    }

    /// Park the reaper at its next safe point and wait until it is there.
    ///
    /// Pauses do not nest: one [`resume`](Self::resume) undoes any number of them.
    pub fn pause(&self) -> GcResult<()> {
        if thread::current().id() == self.thread_id {
            return Err(invariant_violation("the reaper cannot pause itself"));
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(ReaperMessage::Pause { ack: ack_tx })
            .map_err(|_| GcError::ReaperStopped)?;
        ack_rx.recv().map_err(|_| GcError::ReaperStopped)
    }

    /// Let a parked reaper continue; a no-op when it is running
    pub fn resume(&self) {
        let _ = self.tx.send(ReaperMessage::Resume);
    }

    /// Current state of the thread
    pub fn state(&self) -> ReaperState {
        self.safepoint.state()
    }

    /// True while parked
    pub fn is_paused(&self) -> bool {
        self.safepoint.is_paused()
    }

    /// Shared safe point state
    pub fn safepoint(&self) -> &SafePoint {
        &self.safepoint
    }

    /// Stop the thread and wait for it. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let _ = self.tx.send(ReaperMessage::Shutdown);
        if thread::current().id() == self.thread_id {
            // dropped from inside a step; the loop exits after it returns
            return;
        }
        if handle.join().is_err() {
            warn!(name = %self.name, "reaper thread panicked");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Reaper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaper")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Countdown {
        remaining: AtomicUsize,
        steps: AtomicUsize,
        idles: AtomicUsize,
        faults: AtomicUsize,
    }

    impl ReclaimWork for Countdown {
        fn has_pending(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }

        fn step(&self) -> Result<StepOutcome, ReapFault> {
            let left = self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.steps.fetch_add(1, Ordering::SeqCst);
            match left {
                3 => Err(ReapFault::new(None, "rejected")),
                2 => panic!("boom"),
                _ => Ok(StepOutcome::Processed(SlotId::new(left as u32, 0))),
            }
        }

        fn idle_notification(&self, _budget_ms: u64) {
            self.idles.fetch_add(1, Ordering::SeqCst);
        }

        fn on_fault(&self, _fault: &ReapFault) {
            self.faults.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_pass_skips_faults() {
        let work = Countdown::default();
        work.remaining.store(4, Ordering::SeqCst);

        let report = run_pass(&work, &ReaperConfig::default());
        assert_eq!(report.processed, 2);
        assert_eq!(report.faults, 2);
        assert_eq!(work.faults.load(Ordering::SeqCst), 2);
        // one per step plus the closing notification
        assert_eq!(work.idles.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panic_payloads() {
        let fault = ReapFault::panicked("step", Box::new("static"));
        assert_eq!(fault.reason, "step panicked: static");
        let fault = ReapFault::panicked("idle tick", Box::new(String::from("owned")));
        assert_eq!(fault.reason, "idle tick panicked: owned");
    }

    /// Panics in every idle hook; steps succeed
    #[derive(Default)]
    struct NoisyIdle {
        remaining: AtomicUsize,
        faults: Mutex<Vec<String>>,
    }

    impl ReclaimWork for NoisyIdle {
        fn has_pending(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }

        fn step(&self) -> Result<StepOutcome, ReapFault> {
            let left = self.remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(StepOutcome::Processed(SlotId::new(left as u32, 0)))
        }

        fn idle_notification(&self, _budget_ms: u64) {
            panic!("engine busy");
        }

        fn on_idle_tick(&self) {
            panic!("tick failed");
        }

        fn on_fault(&self, fault: &ReapFault) {
            self.faults.lock().push(fault.reason.clone());
        }
    }

    #[test]
    fn test_idle_hook_panics_are_contained() {
        let work = NoisyIdle::default();
        work.remaining.store(2, Ordering::SeqCst);

        let report = run_pass(&work, &ReaperConfig::default());
        assert_eq!(report.processed, 2);
        // two per-step notifications, the tick and the closing notification
        assert_eq!(report.faults, 4);
        let faults = work.faults.lock();
        assert_eq!(faults[0], "idle notification panicked: engine busy");
        assert_eq!(faults[2], "idle tick panicked: tick failed");
    }

    #[test]
    fn test_reaper_survives_idle_panics() {
        let work = Arc::new(NoisyIdle::default());
        let config = ReaperConfig {
            interval: Duration::from_millis(1),
            ..ReaperConfig::default()
        };
        let reaper = Reaper::spawn(work.clone(), config).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while work.faults.lock().len() < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(work.faults.lock().len() >= 4);

        work.remaining.store(1, Ordering::SeqCst);
        reaper.wake();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while work.has_pending() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!work.has_pending());
        assert_eq!(reaper.state(), ReaperState::Running);
        reaper.pause().unwrap();
        reaper.resume();
        reaper.shutdown();
    }
}

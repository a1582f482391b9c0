//! Reaper safe point state
//!
//! The reaper only parks between steps, so an observed `Paused` state means
//! no entry is mid-transition.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Where the background reaper currently is
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// Draining or sleeping between passes
    Running = 0,
    /// Parked at a safe point until resumed
    Paused = 1,
    /// The thread has exited
    Stopped = 2,
}

impl From<u8> for ReaperState {
    fn from(v: u8) -> Self {
        match v {
            0 => ReaperState::Running,
            1 => ReaperState::Paused,
            _ => ReaperState::Stopped,
        }
    }
}

/// State shared between the reaper thread and its controllers
#[derive(Debug)]
pub struct SafePoint {
    state: AtomicU8,
    pauses: AtomicU64,
}

impl SafePoint {
    /// Fresh state for a thread about to start
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ReaperState::Running as u8),
            pauses: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> ReaperState {
        ReaperState::from(self.state.load(Ordering::Acquire))
    }

    /// True while parked
    pub fn is_paused(&self) -> bool {
        self.state() == ReaperState::Paused
    }

    /// True once the thread is gone
    pub fn is_stopped(&self) -> bool {
        self.state() == ReaperState::Stopped
    }

    /// How many times the reaper has parked
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_paused(&self) {
        if self
            .state
            .compare_exchange(
                ReaperState::Running as u8,
                ReaperState::Paused as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.pauses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn leave_paused(&self) {
        let _ = self.state.compare_exchange(
            ReaperState::Paused as u8,
            ReaperState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(ReaperState::Stopped as u8, Ordering::Release);
    }
}

impl Default for SafePoint {
    fn default() -> Self {
        Self::new()
    }
}

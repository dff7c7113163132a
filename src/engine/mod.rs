// Orchestration engine: step registry, retry/fallback policy, progress tracking, result ledger

pub mod ledger;
pub mod policy;
pub mod registry;
pub mod summary;
pub mod tracker;

use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Cooperative run control, checked between steps and at retry boundaries: cancellation, plus a
/// pause flag that holds the run at the next boundary until resumed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("[PHASE: install] [STEP: cancel] Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("[PHASE: install] [STEP: pause] Pause requested");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("[PHASE: install] [STEP: pause] Resume requested");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Flip between paused and running; returns the new paused state.
    pub fn toggle_pause(&self) -> bool {
        if self.is_paused() {
            self.resume();
            false
        } else {
            self.pause();
            true
        }
    }

    /// Hold while paused. Returns as soon as the run is resumed or cancelled.
    pub async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }
}

//! Sync progress record.
//!
//! Each phase owns a fixed slice of the 0..=100 range. `SyncProgress::advance`
//! never moves `current` backwards, so observers see a monotonic bar even when
//! a phase finishes early.

use serde::{Deserialize, Serialize};

pub const PROGRESS_TOTAL: u8 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetch,
    Filter,
    Extract,
    DriveCheck,
    Finalize,
    Done,
}

impl SyncPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetch => "fetching messages",
            SyncPhase::Filter => "filtering for relevance",
            SyncPhase::Extract => "extracting events and contacts",
            SyncPhase::DriveCheck => "checking drive",
            SyncPhase::Finalize => "finalizing",
            SyncPhase::Done => "done",
        }
    }

    /// Slice of the progress bar owned by this phase.
    pub fn range(&self) -> (u8, u8) {
        match self {
            SyncPhase::Idle => (0, 0),
            SyncPhase::Fetch => (0, 20),
            SyncPhase::Filter => (20, 50),
            SyncPhase::Extract => (50, 90),
            SyncPhase::DriveCheck => (90, 95),
            SyncPhase::Finalize => (95, 100),
            SyncPhase::Done => (100, 100),
        }
    }

    /// Position inside this phase after `done` of `of` units of work.
    pub fn position(&self, done: usize, of: usize) -> u8 {
        let (start, end) = self.range();
        if of == 0 {
            return end;
        }
        let span = (end - start) as usize;
        let step = span * done.min(of) / of;
        start + step as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncProgress {
    pub current: u8,
    pub total: u8,
    pub phase: SyncPhase,
    pub message: String,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::idle()
    }
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self {
            current: 0,
            total: PROGRESS_TOTAL,
            phase: SyncPhase::Idle,
            message: SyncPhase::Idle.label().to_string(),
        }
    }

    pub fn starting() -> Self {
        Self {
            current: 0,
            total: PROGRESS_TOTAL,
            phase: SyncPhase::Fetch,
            message: "starting sync".to_string(),
        }
    }

    /// Move into `phase` at `position`, clamped so `current` never decreases.
    pub fn advance(&mut self, phase: SyncPhase, position: u8, message: impl Into<String>) {
        self.phase = phase;
        self.current = self.current.max(position.min(PROGRESS_TOTAL));
        self.message = message.into();
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

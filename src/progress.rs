//! Phase tracking and the progress record observers subscribe to.
//!
//! The engine is the only writer. Observers get a `watch` receiver for the
//! latest snapshot and a `broadcast` receiver that sees every phase
//! transition in order, so nobody has to poll shared flags.

use std::fmt;

use log::debug;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Idle,
    ChannelSecuring,
    ChannelSecured,
    Negotiating,
    FileTransfer,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Status line shown to users.
    pub fn describe(self) -> &'static str {
        match self {
            Phase::Idle => "Idle.",
            Phase::ChannelSecuring => "Securing channel.",
            Phase::ChannelSecured => "Channel secured.",
            Phase::Negotiating => "Negotiating transfer.",
            Phase::FileTransfer => "Transferring file.",
            Phase::Done => "Finished transfer.",
            Phase::Failed => "Transfer failed.",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Phase,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub current_file: Option<String>,
    pub failure: Option<String>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            bytes_transferred: 0,
            total_bytes: 0,
            current_file: None,
            failure: None,
        }
    }
}

impl ProgressState {
    /// Fraction done in `[0.0, 1.0]`; an empty transfer counts as done once `Done`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.phase == Phase::Done { 1.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Single writer of a session's progress.
pub struct ProgressReporter {
    state: watch::Sender<ProgressState>,
    transitions: broadcast::Sender<Phase>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProgressState::default());
        let (transitions, _) = broadcast::channel(16);
        Self { state, transitions }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.state.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Phase> {
        self.transitions.subscribe()
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    /// Move forward to `next`. Returns false (and changes nothing) if `next`
    /// is not strictly later than the current phase or the session already
    /// ended.
    pub fn advance_phase(&self, next: Phase) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if state.phase.is_terminal() || next <= state.phase {
                return false;
            }
            state.phase = next;
            moved = true;
            true
        });
        if moved {
            debug!("Phase -> {:?}", next);
            let _ = self.transitions.send(next);
        }
        moved
    }

    pub fn fail(&self, reason: &str) {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = Phase::Failed;
            state.failure = Some(reason.to_string());
            moved = true;
            true
        });
        if moved {
            debug!("Phase -> Failed ({})", reason);
            let _ = self.transitions.send(Phase::Failed);
        }
    }

    pub fn set_totals(&self, total_bytes: u64, already_transferred: u64) {
        self.state.send_modify(|state| {
            state.total_bytes = total_bytes;
            state.bytes_transferred = already_transferred;
        });
    }

    pub fn set_current_file(&self, name: &str) {
        self.state.send_modify(|state| state.current_file = Some(name.to_string()));
    }

    pub fn advance(&self, bytes: u64) {
        self.state.send_modify(|state| {
            state.bytes_transferred = (state.bytes_transferred + bytes).min(state.total_bytes);
        });
    }
}

use std::sync::atomic::{AtomicU8, Ordering};

/// Process-wide run phase. Transitions only move forward; a listener restart
/// after an error stays within `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunState {
    Booting = 0,
    Running = 1,
    Quieting = 2,
    Quiet = 3,
    Stopping = 4,
    Stopped = 5,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Booting,
            1 => RunState::Running,
            2 => RunState::Quieting,
            3 => RunState::Quiet,
            4 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

/// Shared atomic cell holding the run phase. The listener observes it;
/// signal handlers (or a forced-shutdown timer) flip it from foreign tasks.
#[derive(Debug)]
pub struct Status {
    state: AtomicU8,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Booting as u8),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Advance to `next` unless the current phase is already further along.
    pub fn transition(&self, next: RunState) {
        self.state.fetch_max(next as u8, Ordering::SeqCst);
    }

    /// Request quiet mode: stop scheduling flow jobs but keep the session
    /// alive until an explicit stop.
    pub fn quiet(&self) {
        self.transition(RunState::Quieting);
    }

    /// Request a full stop.
    pub fn stop(&self) {
        self.transition(RunState::Stopping);
    }

    /// True once a quiet or stop request was observed.
    pub fn done(&self) -> bool {
        self.state() >= RunState::Quieting
    }

    pub fn running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn quieting(&self) -> bool {
        self.state() == RunState::Quieting
    }

    pub fn quieted(&self) -> bool {
        self.state() == RunState::Quiet
    }

    pub fn stopping(&self) -> bool {
        self.state() >= RunState::Stopping
    }

    pub fn stopped(&self) -> bool {
        self.state() == RunState::Stopped
    }
}

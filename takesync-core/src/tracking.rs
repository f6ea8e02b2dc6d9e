//! Edge detection for the capture-source link.
//!
//! Both trackers remember the last observed value and only report a change
//! on an actual edge, never on every poll.

use serde::{Deserialize, Serialize};

// =============================================================================
// Process identity
// =============================================================================

/// Result of one process-liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessObservation {
    /// Still not running
    Absent,
    /// Was running, now gone
    Vanished { pid: u32 },
    /// Was not running, now found
    Appeared { pid: u32 },
    /// Same process as last time
    Present { pid: u32 },
    /// A different process instance replaced the previous one
    Restarted { previous: u32, pid: u32 },
}

impl ProcessObservation {
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            ProcessObservation::Absent | ProcessObservation::Vanished { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    pid: Option<u32>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn observe(&mut self, found: Option<u32>) -> ProcessObservation {
        let previous = std::mem::replace(&mut self.pid, found);
        match (previous, found) {
            (None, None) => ProcessObservation::Absent,
            (Some(pid), None) => ProcessObservation::Vanished { pid },
            (None, Some(pid)) => ProcessObservation::Appeared { pid },
            (Some(previous), Some(pid)) if previous == pid => ProcessObservation::Present { pid },
            (Some(previous), Some(pid)) => ProcessObservation::Restarted { previous, pid },
        }
    }
}

// =============================================================================
// Capture name
// =============================================================================

/// Last observed capture name.
#[derive(Debug, Clone, Default)]
pub struct NameTracker {
    last: Option<String>,
}

impl NameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Returns the new name only when it differs from the last one seen.
    pub fn observe(&mut self, name: &str) -> Option<String> {
        if self.last.as_deref() == Some(name) {
            return None;
        }
        self.last = Some(name.to_string());
        self.last.clone()
    }

    /// Adopt a name we set ourselves, without reporting it as an edge.
    pub fn assume(&mut self, name: &str) {
        self.last = Some(name.to_string());
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

// =============================================================================
// Capture state text
// =============================================================================

/// Take name shown while the controller process is gone.
pub const TAKE_NO_CONNECTION: &str = "No connection";
/// Take name shown once a recording was stopped.
pub const TAKE_NO_RECORDING: &str = "No active recording";
/// Take name shown when a recording started but the controller gave no name.
pub const TAKE_UNNAMED: &str = "Active recording";

/// The controller reports its capture state as free text.
pub fn is_recording_state(state: &str) -> bool {
    state.contains("Started") || state.contains("Recording")
}

/// Take name to show after a start, falling back to a placeholder.
pub fn take_name_or_placeholder(name: &str) -> &str {
    if name.trim().is_empty() {
        TAKE_UNNAMED
    } else {
        name
    }
}

//! Connection state machine for recorder and capture-source links.
//!
//! The types here hold no sockets. The server owns the I/O and reports each
//! outcome to a [`ConnectionManager`], which answers whether an observable
//! transition happened so events stay edge-triggered.
//!
//! ```text
//!   Disconnected ──connect()──► Connecting ──ok──► Connected
//!        ▲                          │                 │
//!        │                        error           I/O error
//!        │                          ▼                 ▼
//!        └──────disconnect()─── Reconnecting ◄────────┘
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of a single recorder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No session and no attempt in progress
    #[default]
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Session open and usable
    Connected,
    /// Session was lost, waiting for or performing a retry
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is usable for sending commands
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a connection attempt is in progress or scheduled
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Lifecycle of the capture-source link, which also tracks the controller process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CaptureState {
    /// Controller process is not running
    #[default]
    NoProcess,
    /// Process is running but there is no API session
    Disconnected,
    Connecting,
    Connected,
    /// API stopped answering, backoff reconnect in progress
    Reconnecting,
}

impl CaptureState {
    pub fn is_connected(&self) -> bool {
        matches!(self, CaptureState::Connected)
    }

    /// Collapse onto the per-device connection enum for uniform reporting.
    pub fn connection(&self) -> ConnectionState {
        match self {
            CaptureState::NoProcess | CaptureState::Disconnected => ConnectionState::Disconnected,
            CaptureState::Connecting => ConnectionState::Connecting,
            CaptureState::Connected => ConnectionState::Connected,
            CaptureState::Reconnecting => ConnectionState::Reconnecting,
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureState::NoProcess => write!(f, "No Process"),
            CaptureState::Disconnected => write!(f, "Disconnected"),
            CaptureState::Connecting => write!(f, "Connecting"),
            CaptureState::Connected => write!(f, "Connected"),
            CaptureState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Tracks connection state and consecutive failures.
///
/// Every transition method returns `true` only when the state actually changed.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    state: ConnectionState,
    failure_count: u32,
    /// Set once `shutdown()` is called; blocks any further attempts
    stopped: bool,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of consecutive failed attempts since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// An explicit connect was requested. Clears a previous shutdown.
    pub fn start_connecting(&mut self) -> bool {
        self.stopped = false;
        self.set_state(ConnectionState::Connecting)
    }

    pub fn connected(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.failure_count = 0;
        self.set_state(ConnectionState::Connected)
    }

    /// An attempt failed or an open session was lost.
    ///
    /// Moves to `Reconnecting` unless the link was shut down, in which case it
    /// stays `Disconnected`.
    pub fn lost(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.stopped {
            return self.set_state(ConnectionState::Disconnected);
        }
        self.set_state(ConnectionState::Reconnecting)
    }

    /// A first connect attempt failed. The caller decides whether to retry.
    pub fn failed(&mut self) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.set_state(ConnectionState::Disconnected)
    }

    /// Deliberate disconnect; no further automatic attempts.
    pub fn shutdown(&mut self) -> bool {
        self.stopped = true;
        self.set_state(ConnectionState::Disconnected)
    }

    fn set_state(&mut self, state: ConnectionState) -> bool {
        let changed = self.state != state;
        self.state = state;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_defaults() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(CaptureState::default(), CaptureState::NoProcess);
        assert!(ConnectionState::Connected.can_send());
        assert!(!ConnectionState::Reconnecting.can_send());
        assert!(ConnectionState::Reconnecting.is_connecting());
    }

    #[test]
    fn test_capture_state_projection() {
        assert_eq!(
            CaptureState::NoProcess.connection(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            CaptureState::Reconnecting.connection(),
            ConnectionState::Reconnecting
        );
        assert!(CaptureState::Connected.is_connected());
    }

    #[test]
    fn test_transitions_report_edges() {
        let mut conn = ConnectionManager::new();
        assert!(conn.start_connecting());
        assert!(!conn.start_connecting());
        assert!(conn.connected());
        assert!(!conn.connected());
        assert!(conn.can_send());

        assert!(conn.lost());
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert_eq!(conn.failure_count(), 1);
        assert!(!conn.lost());
        assert_eq!(conn.failure_count(), 2);

        assert!(conn.connected());
        assert_eq!(conn.failure_count(), 0);
    }

    #[test]
    fn test_shutdown_blocks_reconnect() {
        let mut conn = ConnectionManager::new();
        conn.start_connecting();
        conn.connected();
        assert!(conn.shutdown());
        assert!(conn.is_stopped());
        assert!(!conn.lost());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.connected());

        conn.start_connecting();
        assert!(!conn.is_stopped());
        assert!(conn.connected());
    }

    #[test]
    fn test_failed_first_attempt() {
        let mut conn = ConnectionManager::new();
        conn.start_connecting();
        assert!(conn.failed());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.failure_count(), 1);
    }
}

use thiserror::Error;

use takesync_core::{DeviceId, ProtocolError};

/// Failure reported by the capture-controller client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureApiError {
    /// The call did not reach the controller (socket closed, API gone)
    #[error("Capture controller unavailable: {0}")]
    Unavailable(String),
    /// The controller answered and refused the request
    #[error("Capture controller refused: {0}")]
    Rejected(String),
}

/// One device's share of a fleet-level failure.
#[derive(Debug)]
pub struct DeviceFailure {
    pub device: DeviceId,
    pub cause: SyncError,
}

impl std::fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "recorder {}: {}", self.device, self.cause)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O operation failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("{0} is not connected")]
    NotConnected(String),
    #[error("Timeout")]
    Timeout,
    #[error("Command rejected: {code} {message}")]
    Command { code: u16, message: String },
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("Capture controller process not found")]
    ProcessNotFound,
    #[error("{0}")]
    CaptureApi(#[from] CaptureApiError),
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("{} recorder(s) failed: {}", .0.len(), join_failures(.0))]
    PartialFailure(Vec<DeviceFailure>),
    #[error("No such recorder {0}")]
    NoSuchDevice(DeviceId),
    #[error("Cannot load configuration: {0}")]
    Config(String),
    #[error("Shutdown")]
    Shutdown,
}

fn join_failures(failures: &[DeviceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    /// Errors that mean the session is gone and must be rebuilt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::ConnectionClosed | SyncError::NotConnected(_)
        )
    }

    /// Device ids listed in a [`SyncError::PartialFailure`].
    pub fn failed_devices(&self) -> Vec<DeviceId> {
        match self {
            SyncError::PartialFailure(failures) => failures.iter().map(|f| f.device).collect(),
            _ => Vec::new(),
        }
    }
}

//! Event bus shared by every link.
//!
//! Each component publishes [`SyncEvent`]s on a single broadcast channel.
//! Subscribers (the message bridge, the binary's status logger, tests) never
//! touch link-owned state; they only see transitions.

use serde::Serialize;
use tokio::sync::broadcast;

use takesync_core::{CaptureState, Clip, ConnectionState, DeviceId};

const EVENT_CAPACITY: usize = 256;

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorSource {
    Device(DeviceId),
    CaptureSource,
    Fleet,
    Orchestrator,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSource::Device(id) => write!(f, "recorder {}", id),
            ErrorSource::CaptureSource => write!(f, "capture source"),
            ErrorSource::Fleet => write!(f, "recorder fleet"),
            ErrorSource::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// A failure that survived local recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub source: ErrorSource,
    pub operation: String,
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SyncEvent {
    RecorderState {
        device: DeviceId,
        state: ConnectionState,
    },
    RecorderRecording {
        device: DeviceId,
        recording: bool,
    },
    RecorderStatus {
        device: DeviceId,
        status: String,
    },
    RecorderClips {
        device: DeviceId,
        clips: Vec<Clip>,
    },
    FleetRecording {
        recording: bool,
    },
    CaptureState {
        state: CaptureState,
    },
    CaptureRecording {
        recording: bool,
    },
    CaptureNameChanged {
        name: String,
    },
    TakeName {
        name: String,
    },
    RecordingStarted {
        session_name: String,
    },
    RecordingStopped {
        session_name: String,
    },
    Error(ErrorReport),
}

/// Cloneable publishing side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        log::trace!("event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Log and publish a failure.
    pub fn error(&self, source: ErrorSource, operation: &str, cause: impl ToString) {
        let cause = cause.to_string();
        log::error!("{}: {} failed: {}", source, operation, cause);
        self.emit(SyncEvent::Error(ErrorReport {
            source,
            operation: operation.to_string(),
            cause,
        }));
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::FleetRecording { recording: true });
    }

    #[test]
    fn test_error_report() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.error(ErrorSource::Device(2), "start recording", "Timeout");
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::Error(ErrorReport {
                source: ErrorSource::Device(2),
                operation: "start recording".into(),
                cause: "Timeout".into(),
            })
        );
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_string(&SyncEvent::RecorderRecording {
            device: 1,
            recording: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"recorderRecording","device":1,"recording":true}"#);
    }
}

//! Single synchronised start/stop entry point.
//!
//! The capture source is the timing authority: it starts first, and its take
//! name becomes the session name that the recorders derive their clip names
//! from. Stop runs in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use takesync_core::tracking::{TAKE_NO_CONNECTION, TAKE_NO_RECORDING, TAKE_UNNAMED};
use takesync_core::DeviceId;

use crate::capture::CaptureSourceLink;
use crate::error::SyncError;
use crate::events::{ErrorSource, EventBus, SyncEvent};
use crate::recorder::RecorderFleet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Include the recorder fleet in synchronised takes
    pub recorders_enabled: bool,
    /// Mirror capture starts/stops made at the controller onto the fleet
    pub sync_with_capture: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            recorders_enabled: true,
            sync_with_capture: true,
        }
    }
}

/// The take currently in progress, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSession {
    pub active: bool,
    pub source_name: String,
    pub per_device_recording: BTreeMap<DeviceId, bool>,
}

pub struct RecordingOrchestrator {
    capture: Arc<CaptureSourceLink>,
    fleet: Arc<RecorderFleet>,
    settings: OrchestratorSettings,
    events: EventBus,
    session: tokio::sync::Mutex<RecordingSession>,
}

impl RecordingOrchestrator {
    pub fn new(
        capture: Arc<CaptureSourceLink>,
        fleet: Arc<RecorderFleet>,
        settings: OrchestratorSettings,
        events: EventBus,
    ) -> Self {
        RecordingOrchestrator {
            capture,
            fleet,
            settings,
            events,
            session: tokio::sync::Mutex::new(RecordingSession::default()),
        }
    }

    pub fn capture(&self) -> &Arc<CaptureSourceLink> {
        &self.capture
    }

    pub fn fleet(&self) -> &Arc<RecorderFleet> {
        &self.fleet
    }

    pub async fn session(&self) -> RecordingSession {
        self.session.lock().await.clone()
    }

    pub async fn is_recording(&self) -> bool {
        self.session.lock().await.active
    }

    /// Start the capture source, then the recorders.
    ///
    /// Returns the session name. While a session is active this is a no-op
    /// returning the current name. A recorder failure does not undo the
    /// capture: the fleet rolls itself back and the failure is reported as
    /// an event.
    pub async fn start_all(&self) -> Result<String, SyncError> {
        let mut session = self.session.lock().await;
        if session.active {
            log::info!("already recording '{}'", session.source_name);
            return Ok(session.source_name.clone());
        }

        if !self.capture.is_connected() {
            let e = SyncError::NotConnected("Capture source".to_string());
            self.events.error(ErrorSource::Orchestrator, "start all", &e);
            return Err(e);
        }

        let with_fleet = self.settings.recorders_enabled && self.fleet_ready().await;

        let name = self.capture.start_recording().await?;
        session.active = true;
        session.source_name = name.clone();
        session.per_device_recording.clear();

        if with_fleet {
            self.start_fleet(&mut session).await;
        }

        log::info!("recording started: '{}'", name);
        self.events.emit(SyncEvent::RecordingStarted {
            session_name: name.clone(),
        });
        Ok(name)
    }

    /// Stop the capture source, then the recorders. A no-op while idle.
    ///
    /// If the capture source cannot be stopped the session stays active so
    /// the stop can be retried; the recorders are stopped regardless.
    pub async fn stop_all(&self) -> Result<(), SyncError> {
        let mut session = self.session.lock().await;
        if !session.active {
            log::debug!("stop requested while idle");
            return Ok(());
        }

        let capture_result = self.capture.stop_recording().await;
        let fleet_result = if self.settings.recorders_enabled {
            self.fleet.stop_recording(None).await
        } else {
            Ok(())
        };
        session.per_device_recording = self.fleet.recording_devices().await;

        capture_result?;

        let name = std::mem::take(&mut session.source_name);
        session.active = false;
        log::info!("recording stopped: '{}'", name);
        self.events.emit(SyncEvent::RecordingStopped { session_name: name });
        fleet_result
    }

    /// Start only the capture source.
    pub async fn start_capture(&self) -> Result<String, SyncError> {
        self.capture.start_recording().await
    }

    pub async fn stop_capture(&self) -> Result<(), SyncError> {
        self.capture.stop_recording().await
    }

    /// Start only the recorders, named after the current take when there is one.
    pub async fn start_recorders(&self, devices: Option<&[DeviceId]>) -> Result<(), SyncError> {
        let session = self.session.lock().await;
        let base = (session.active && !session.source_name.is_empty())
            .then(|| session.source_name.clone());
        drop(session);
        self.fleet.start_recording(devices, base.as_deref()).await
    }

    pub async fn stop_recorders(&self, devices: Option<&[DeviceId]>) -> Result<(), SyncError> {
        self.fleet.stop_recording(devices).await
    }

    /// Mirror recording edges the capture controller makes on its own onto
    /// the fleet, until `cancel` fires.
    pub async fn follow_capture(&self, cancel: CancellationToken) {
        if !self.settings.sync_with_capture || !self.settings.recorders_enabled {
            log::debug!("capture follow disabled");
            return;
        }
        let mut events = self.events.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SyncEvent::CaptureRecording { recording }) => self.follow(recording).await,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => log::warn!("capture follow missed {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn follow(&self, recording: bool) {
        let mut session = self.session.lock().await;
        match (recording, session.active) {
            (true, false) => {
                let name = self
                    .capture
                    .status()
                    .take_name
                    .filter(|n| !is_placeholder(n))
                    .unwrap_or_default();
                log::info!("capture started at the controller, following with recorders");
                session.active = true;
                session.source_name = name.clone();
                if self.fleet_ready().await {
                    self.start_fleet(&mut session).await;
                }
                self.events.emit(SyncEvent::RecordingStarted { session_name: name });
            }
            (false, true) => {
                log::info!("capture stopped at the controller, stopping recorders");
                if let Err(e) = self.fleet.stop_recording(None).await {
                    self.events.error(ErrorSource::Fleet, "follow stop", &e);
                }
                session.per_device_recording = self.fleet.recording_devices().await;
                session.active = false;
                let name = std::mem::take(&mut session.source_name);
                self.events.emit(SyncEvent::RecordingStopped { session_name: name });
            }
            _ => {}
        }
    }

    async fn fleet_ready(&self) -> bool {
        if self.fleet.has_devices().await {
            return true;
        }
        log::warn!("recorders enabled but none connected, recording capture source only");
        false
    }

    async fn start_fleet(&self, session: &mut RecordingSession) {
        let base = (!session.source_name.is_empty()).then(|| session.source_name.clone());
        if let Err(e) = self.fleet.start_recording(None, base.as_deref()).await {
            self.events.error(ErrorSource::Fleet, "start recorders", &e);
        }
        session.per_device_recording = self.fleet.recording_devices().await;
    }
}

fn is_placeholder(take_name: &str) -> bool {
    [TAKE_NO_CONNECTION, TAKE_NO_RECORDING, TAKE_UNNAMED].contains(&take_name)
}

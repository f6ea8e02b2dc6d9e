//! Message bridge between an inbound/outbound message transport and the
//! orchestrator.
//!
//! Transport handlers run on whatever thread the transport uses. They never
//! call into a link directly: each handler turns its message into a
//! [`BridgeRequest`] and hands it over a channel to [`MessageBridge::run`],
//! which executes it on the runtime.
//!
//! | Inbound address          | Action                         |
//! |--------------------------|--------------------------------|
//! | `/RecordStartAll`        | start capture source + fleet   |
//! | `/RecordStopAll`         | stop capture source + fleet    |
//! | `/RecordStartShogunLive` | start capture source only      |
//! | `/RecordStopShogunLive`  | stop capture source only       |
//! | `/RecordStartHyperDeck`  | start recorders (optional id)  |
//! | `/RecordStopHyperDeck`   | stop recorders (optional id)   |

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use takesync_core::DeviceId;

use crate::error::SyncError;
use crate::events::{ErrorSource, EventBus, SyncEvent};
use crate::orchestrator::RecordingOrchestrator;

pub mod memory;

pub use memory::MemoryTransport;

/// Message addresses understood and produced by the bridge.
pub mod address {
    pub const START_ALL: &str = "/RecordStartAll";
    pub const STOP_ALL: &str = "/RecordStopAll";
    pub const START_CAPTURE: &str = "/RecordStartShogunLive";
    pub const STOP_CAPTURE: &str = "/RecordStopShogunLive";
    pub const START_RECORDERS: &str = "/RecordStartHyperDeck";
    pub const STOP_RECORDERS: &str = "/RecordStopHyperDeck";

    pub const CAPTURE_NAME: &str = "/ShogunLiveCaptureName";
    pub const CAPTURE_ERROR: &str = "/ShogunCaptureError";
    pub const RECORDER_STATUS: &str = "/HyperDeckStatus";
    pub const RECORDER_ERROR: &str = "/HyperDeckError";
    pub const RECORDER_CONNECTED: &str = "/HyperDeckConnected";
}

const REQUEST_QUEUE: usize = 32;

/// One argument of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MessageValue {
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl MessageValue {
    /// Typed value of one console token.
    pub fn parse(token: &str) -> Self {
        if let Ok(i) = token.parse::<i64>() {
            return MessageValue::Int(i);
        }
        if let Ok(f) = token.parse::<f64>() {
            return MessageValue::Float(f);
        }
        match token {
            "true" => MessageValue::Bool(true),
            "false" => MessageValue::Bool(false),
            "nil" => MessageValue::Nil,
            _ => MessageValue::Str(token.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MessageValue::Int(i) => Some(*i),
            MessageValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            MessageValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(&[MessageValue]) + Send + Sync>;

/// Inbound/outbound message transport.
pub trait MessageTransport: Send + Sync {
    fn register_handler(&self, address: &str, handler: MessageHandler);
    fn send_message(&self, address: &str, value: MessageValue) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    StartAll,
    StopAll,
    StartCapture,
    StopCapture,
    StartRecorders(Option<DeviceId>),
    StopRecorders(Option<DeviceId>),
}

impl BridgeRequest {
    fn name(&self) -> &'static str {
        match self {
            BridgeRequest::StartAll => "start all",
            BridgeRequest::StopAll => "stop all",
            BridgeRequest::StartCapture => "start capture",
            BridgeRequest::StopCapture => "stop capture",
            BridgeRequest::StartRecorders(_) => "start recorders",
            BridgeRequest::StopRecorders(_) => "stop recorders",
        }
    }
}

pub struct MessageBridge {
    orchestrator: Arc<RecordingOrchestrator>,
    transport: Arc<dyn MessageTransport>,
    events: EventBus,
}

impl MessageBridge {
    pub fn new(
        orchestrator: Arc<RecordingOrchestrator>,
        transport: Arc<dyn MessageTransport>,
        events: EventBus,
    ) -> Self {
        MessageBridge {
            orchestrator,
            transport,
            events,
        }
    }

    /// Register every inbound handler. Requests arrive on the returned receiver.
    pub fn install(&self) -> mpsc::Receiver<BridgeRequest> {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);

        let routes: [(&str, fn(Option<DeviceId>) -> BridgeRequest); 6] = [
            (address::START_ALL, |_| BridgeRequest::StartAll),
            (address::STOP_ALL, |_| BridgeRequest::StopAll),
            (address::START_CAPTURE, |_| BridgeRequest::StartCapture),
            (address::STOP_CAPTURE, |_| BridgeRequest::StopCapture),
            (address::START_RECORDERS, BridgeRequest::StartRecorders),
            (address::STOP_RECORDERS, BridgeRequest::StopRecorders),
        ];

        for (addr, make) in routes {
            let tx = tx.clone();
            let handler: MessageHandler = Arc::new(move |args: &[MessageValue]| {
                let device = args
                    .first()
                    .and_then(MessageValue::as_int)
                    .and_then(|i| DeviceId::try_from(i).ok());
                if let Err(e) = tx.try_send(make(device)) {
                    log::warn!("dropping inbound request: {}", e);
                }
            });
            self.transport.register_handler(addr, handler);
            log::debug!("registered handler for {}", addr);
        }
        rx
    }

    /// Execute inbound requests and forward events until `cancel` fires.
    pub async fn run(&self, mut requests: mpsc::Receiver<BridgeRequest>, cancel: CancellationToken) {
        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => {
                        // Failures were already published as events
                        if let Err(e) = self.execute(request.clone()).await {
                            log::debug!("{} failed: {}", request.name(), e);
                        }
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.forward(&event),
                    Err(RecvError::Lagged(n)) => log::warn!("bridge missed {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        log::debug!("message bridge stopped");
    }

    pub async fn execute(&self, request: BridgeRequest) -> Result<(), SyncError> {
        log::info!("inbound request: {}", request.name());
        let o = &self.orchestrator;
        match request {
            BridgeRequest::StartAll => o.start_all().await.map(|_| ()),
            BridgeRequest::StopAll => o.stop_all().await,
            BridgeRequest::StartCapture => o.start_capture().await.map(|_| ()),
            BridgeRequest::StopCapture => o.stop_capture().await,
            BridgeRequest::StartRecorders(device) => {
                let ids: Vec<DeviceId> = device.into_iter().collect();
                o.start_recorders(device.map(|_| ids.as_slice())).await
            }
            BridgeRequest::StopRecorders(device) => {
                let ids: Vec<DeviceId> = device.into_iter().collect();
                o.stop_recorders(device.map(|_| ids.as_slice())).await
            }
        }
    }

    /// Outbound message for an event, if it has one.
    pub fn outbound(event: &SyncEvent) -> Option<(&'static str, MessageValue)> {
        let message = match event {
            SyncEvent::CaptureNameChanged { name } => {
                (address::CAPTURE_NAME, MessageValue::Str(name.clone()))
            }
            SyncEvent::RecorderStatus { device, status } => (
                address::RECORDER_STATUS,
                MessageValue::Str(format!("{}:{}", device, status)),
            ),
            SyncEvent::RecorderState { device, state } => (
                address::RECORDER_CONNECTED,
                MessageValue::Str(format!("{}:{}", device, state.can_send())),
            ),
            SyncEvent::Error(report) => match report.source {
                ErrorSource::Device(id) => (
                    address::RECORDER_ERROR,
                    MessageValue::Str(format!("{}:{}", id, report.cause)),
                ),
                ErrorSource::Fleet => (
                    address::RECORDER_ERROR,
                    MessageValue::Str(report.cause.clone()),
                ),
                ErrorSource::CaptureSource | ErrorSource::Orchestrator => (
                    address::CAPTURE_ERROR,
                    MessageValue::Str(report.cause.clone()),
                ),
            },
            _ => return None,
        };
        Some(message)
    }

    fn forward(&self, event: &SyncEvent) {
        if let Some((addr, value)) = Self::outbound(event) {
            if let Err(e) = self.transport.send_message(addr, value) {
                log::warn!("cannot send {}: {}", addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ErrorReport;
    use takesync_core::ConnectionState;

    #[test]
    fn test_device_argument() {
        assert_eq!(MessageValue::Int(2).as_int(), Some(2));
        assert_eq!(MessageValue::Float(3.0).as_int(), Some(3));
        assert_eq!(MessageValue::Float(3.5).as_int(), None);
        assert_eq!(MessageValue::Str(" 4 ".into()).as_int(), Some(4));
        assert_eq!(MessageValue::Nil.as_int(), None);
    }

    #[test]
    fn test_parse_console_tokens() {
        assert_eq!(MessageValue::parse("2"), MessageValue::Int(2));
        assert_eq!(MessageValue::parse("0.5"), MessageValue::Float(0.5));
        assert_eq!(MessageValue::parse("true"), MessageValue::Bool(true));
        assert_eq!(MessageValue::parse("deck"), MessageValue::Str("deck".into()));
    }

    #[test]
    fn test_outbound_addresses() {
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::CaptureNameChanged {
                name: "Day 2".into()
            }),
            Some((address::CAPTURE_NAME, MessageValue::Str("Day 2".into())))
        );
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::RecorderState {
                device: 2,
                state: ConnectionState::Connected
            }),
            Some((address::RECORDER_CONNECTED, MessageValue::Str("2:true".into())))
        );
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::RecorderStatus {
                device: 1,
                status: "record".into()
            }),
            Some((address::RECORDER_STATUS, MessageValue::Str("1:record".into())))
        );
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::Error(ErrorReport {
                source: ErrorSource::Device(3),
                operation: "start recording".into(),
                cause: "Timeout".into(),
            })),
            Some((address::RECORDER_ERROR, MessageValue::Str("3:Timeout".into())))
        );
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::Error(ErrorReport {
                source: ErrorSource::CaptureSource,
                operation: "start recording".into(),
                cause: "no capture slot armed".into(),
            })),
            Some((
                address::CAPTURE_ERROR,
                MessageValue::Str("no capture slot armed".into())
            ))
        );
        assert_eq!(
            MessageBridge::outbound(&SyncEvent::FleetRecording { recording: true }),
            None
        );
    }

    #[cfg(feature = "emulator")]
    mod live {
        use super::*;
        use crate::capture::{CaptureSourceLink, LinkSettings};
        use crate::emulator::{EmulatedCapture, RecorderEmulator};
        use crate::events::testing::wait_for;
        use crate::orchestrator::OrchestratorSettings;
        use crate::recorder::{EngineSettings, RecorderFleet};
        use std::time::Duration;

        async fn eventually(check: impl Fn() -> bool) {
            for _ in 0..100 {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("condition not reached");
        }

        #[tokio::test]
        async fn test_inbound_messages_drive_recording() {
            let events = EventBus::new();
            let capture = EmulatedCapture::new();
            let link = Arc::new(CaptureSourceLink::new(
                Arc::new(capture.clone()),
                Arc::new(capture.clone()),
                LinkSettings::default(),
                events.clone(),
            ));
            link.ensure_connection().await.unwrap();

            let deck = RecorderEmulator::start("HyperDeck").await.unwrap();
            let settings = EngineSettings {
                poll_interval: Duration::from_secs(60),
                max_poll_interval: Duration::from_secs(60),
                ..EngineSettings::default()
            };
            let fleet = Arc::new(RecorderFleet::new(settings, events.clone()));
            fleet.reconcile(&[deck.endpoint(1)]).await.unwrap();

            let orchestrator = Arc::new(RecordingOrchestrator::new(
                link,
                fleet,
                OrchestratorSettings::default(),
                events.clone(),
            ));
            let transport = Arc::new(MemoryTransport::new());
            let bridge = Arc::new(MessageBridge::new(
                orchestrator.clone(),
                transport.clone(),
                events.clone(),
            ));
            let requests = bridge.install();
            assert_eq!(transport.addresses().len(), 6);

            let mut rx = events.subscribe();
            let cancel = CancellationToken::new();
            let task = {
                let bridge = bridge.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { bridge.run(requests, cancel).await })
            };

            assert!(transport.deliver(address::START_ALL, &[]));
            wait_for(&mut rx, |e| matches!(e, SyncEvent::RecordingStarted { .. })).await;
            assert!(capture.is_recording());
            assert!(deck.is_recording());

            transport.deliver(address::STOP_RECORDERS, &[MessageValue::Int(1)]);
            wait_for(&mut rx, |e| {
                matches!(e, SyncEvent::RecorderRecording { device: 1, recording: false })
            })
            .await;
            assert!(capture.is_recording());

            transport.deliver(address::STOP_CAPTURE, &[]);
            wait_for(&mut rx, |e| *e == SyncEvent::CaptureRecording { recording: false }).await;
            assert!(!capture.is_recording());

            eventually(|| {
                transport
                    .sent_to(address::RECORDER_STATUS)
                    .contains(&MessageValue::Str("1:record".into()))
            })
            .await;

            cancel.cancel();
            task.await.unwrap();
        }
    }
}

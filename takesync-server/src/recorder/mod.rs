//! Recorder protocol engine.
//!
//! One [`RecorderEngine`] per networked recorder. It owns a single TCP
//! session and pushes every command through one slot: a command is written
//! only after the previous one was answered or timed out. Polling and
//! user-triggered commands queue behind each other on that slot.
//!
//! ```text
//!   connect() ──► welcome (5xx) ──► notify: ──► transport info, clips get ──► poll loop
//!                                                               │
//!            every poll interval: transport info ◄──────────────┤
//!            I/O error: teardown, wait reconnect delay, reopen ─┘
//! ```

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use takesync_core::protocol::{
    parse_clips, parse_welcome, Clip, Command, DeviceInfo, ReplyClass, Response,
    ResponseAssembler, TransportInfo,
};
use takesync_core::{
    AdaptiveInterval, ConnectionManager, ConnectionState, DeviceEndpoint, DeviceId,
};

use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::util::{self, sleep_cancellable};

pub mod fleet;
mod session;

pub use fleet::RecorderFleet;
use session::Session;

// =============================================================================
// Settings
// =============================================================================

/// Timing of one engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// Hard deadline for every command
    pub command_timeout: Duration,
    /// Deadline for the TCP connect
    pub connect_timeout: Duration,
    /// Status poll cadence while the device answers
    pub poll_interval: Duration,
    /// Slowest poll cadence after repeated poll failures
    pub max_poll_interval: Duration,
    /// Fixed wait before reopening a lost session
    pub reconnect_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Consecutive poll failures tolerated before the poll cadence slows down.
const POLL_ERROR_THRESHOLD: u32 = 5;

// =============================================================================
// Status
// =============================================================================

/// Observable state of one recorder.
#[derive(Debug, Clone, Default)]
pub struct RecorderStatus {
    pub connection: ConnectionManager,
    pub recording: bool,
    pub device_info: Option<DeviceInfo>,
    pub transport: Option<TransportInfo>,
    pub clips: Vec<Clip>,
}

// =============================================================================
// Engine
// =============================================================================

/// Handle to one recorder. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct RecorderEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    endpoint: DeviceEndpoint,
    key: String,
    settings: EngineSettings,
    events: EventBus,
    status: RwLock<RecorderStatus>,
    /// Session and command slot in one: holding this lock is owning the slot
    session: tokio::sync::Mutex<Option<Session>>,
    poller: Mutex<Option<Poller>>,
}

struct Poller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RecorderEngine {
    pub fn new(endpoint: DeviceEndpoint, settings: EngineSettings, events: EventBus) -> Self {
        let key = endpoint.key();
        RecorderEngine {
            inner: Arc::new(EngineInner {
                endpoint,
                key,
                settings,
                events,
                status: RwLock::new(RecorderStatus::default()),
                session: tokio::sync::Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.endpoint.id
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.inner.endpoint
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn status(&self) -> RecorderStatus {
        util::read(&self.inner.status).clone()
    }

    pub fn state(&self) -> ConnectionState {
        util::read(&self.inner.status).connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().can_send()
    }

    pub fn is_recording(&self) -> bool {
        util::read(&self.inner.status).recording
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        util::read(&self.inner.status).device_info.clone()
    }

    /// Open the session and start polling. A single attempt; already
    /// connected is success.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            return Ok(());
        }
        self.stop_polling();
        self.inner.transition(ConnectionManager::start_connecting);
        log::info!("{}: connecting", self.inner.key);

        match self.inner.open_session().await {
            Ok(()) => {
                self.start_polling();
                Ok(())
            }
            Err(e) => {
                log::warn!("{}: connect failed: {}", self.inner.key, e);
                self.inner.transition(ConnectionManager::failed);
                Err(e)
            }
        }
    }

    /// Close the session and stop polling. Never fails on an already closed engine.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.stop_polling();
        self.inner.transition(ConnectionManager::shutdown);
        // Waits for an in-flight command before closing
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            log::info!("{}: disconnecting", self.inner.key);
            session.close().await;
        }
        self.inner.set_recording(false);
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.disconnect().await?;
        self.connect().await
    }

    /// Send one command and wait for its reply.
    pub async fn send_command(&self, command: &Command) -> Result<Response, SyncError> {
        self.inner.send_command(command).await
    }

    pub async fn start_recording(&self, name: Option<&str>) -> Result<(), SyncError> {
        self.inner.send_command(&Command::record(name)).await?;
        log::info!(
            "{}: recording started{}",
            self.inner.key,
            name.map(|n| format!(" as '{}'", n)).unwrap_or_default()
        );
        self.inner.set_recording(true);
        Ok(())
    }

    /// Stop recording. A device that is not recording is left alone.
    pub async fn stop_recording(&self) -> Result<(), SyncError> {
        if !self.is_recording() {
            log::debug!("{}: not recording, stop skipped", self.inner.key);
            return Ok(());
        }
        self.inner.send_command(&Command::Stop).await?;
        log::info!("{}: recording stopped", self.inner.key);
        self.inner.set_recording(false);
        Ok(())
    }

    pub async fn query_transport_status(&self) -> Result<TransportInfo, SyncError> {
        self.inner.query_transport().await
    }

    pub async fn list_clips(&self) -> Result<Vec<Clip>, SyncError> {
        self.inner.list_clips().await
    }

    fn start_polling(&self) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            self.inner.key.clone(),
        ));
        if let Some(old) = util::lock(&self.inner.poller).replace(Poller { cancel, handle }) {
            old.cancel.cancel();
        }
    }

    fn stop_polling(&self) {
        if let Some(poller) = util::lock(&self.inner.poller).take() {
            poller.cancel.cancel();
            drop(poller.handle);
        }
    }
}

impl EngineInner {
    fn transition(&self, f: impl FnOnce(&mut ConnectionManager) -> bool) {
        let (changed, state) = {
            let mut status = util::write(&self.status);
            let changed = f(&mut status.connection);
            (changed, status.connection.state())
        };
        if changed {
            log::debug!("{}: {}", self.key, state);
            self.events.emit(SyncEvent::RecorderState {
                device: self.endpoint.id,
                state,
            });
        }
    }

    fn set_recording(&self, recording: bool) {
        let changed = {
            let mut status = util::write(&self.status);
            std::mem::replace(&mut status.recording, recording) != recording
        };
        if changed {
            self.events.emit(SyncEvent::RecorderRecording {
                device: self.endpoint.id,
                recording,
            });
        }
    }

    pub(crate) fn apply_transport(&self, info: TransportInfo) {
        let recording = info.is_recording();
        let new_status = info.status().map(str::to_string);
        let status_changed = {
            let mut status = util::write(&self.status);
            let old_status = status
                .transport
                .as_ref()
                .and_then(|t| t.status().map(str::to_string));
            status.transport = Some(info);
            old_status != new_status
        };
        if status_changed {
            if let Some(text) = new_status {
                self.events.emit(SyncEvent::RecorderStatus {
                    device: self.endpoint.id,
                    status: text,
                });
            }
        }
        self.set_recording(recording);
    }

    async fn query_transport(&self) -> Result<TransportInfo, SyncError> {
        let response = self.send_command(&Command::TransportInfo).await?;
        let info = TransportInfo::from_response(&response);
        self.apply_transport(info.clone());
        Ok(info)
    }

    async fn list_clips(&self) -> Result<Vec<Clip>, SyncError> {
        let response = self.send_command(&Command::ClipsGet).await?;
        let clips = parse_clips(&response)?;
        log::debug!("{}: {} clip(s)", self.key, clips.len());
        util::write(&self.status).clips = clips.clone();
        self.events.emit(SyncEvent::RecorderClips {
            device: self.endpoint.id,
            clips: clips.clone(),
        });
        Ok(clips)
    }

    async fn send_command(&self, command: &Command) -> Result<Response, SyncError> {
        let mut guard = self.session.lock().await;

        let Some(session) = guard.as_mut() else {
            return Err(SyncError::NotConnected(self.key.clone()));
        };
        if !session.is_alive() {
            *guard = None;
            drop(guard);
            self.session_lost();
            return Err(SyncError::ConnectionClosed);
        }

        log::trace!("{}: >> {}", self.key, command);
        let deadline = Instant::now() + self.settings.command_timeout;
        let rx = match session.send(command.to_wire(), deadline).await {
            Ok(rx) => rx,
            Err(e) => {
                *guard = None;
                drop(guard);
                self.session_lost();
                return Err(e);
            }
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => {
                session.clear_pending();
                log::warn!(
                    "{}: '{}' timed out, {} late reply(s) to discard",
                    self.key,
                    command,
                    session.owed_replies()
                );
                Err(SyncError::Timeout)
            }
            Ok(Err(_)) => {
                *guard = None;
                drop(guard);
                self.session_lost();
                Err(SyncError::ConnectionClosed)
            }
            Ok(Ok(response)) if response.class() == ReplyClass::Error => {
                log::warn!("{}: '{}' rejected: {}", self.key, command, response);
                Err(SyncError::Command {
                    code: response.code,
                    message: response.message,
                })
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn session_lost(&self) {
        log::warn!("{}: session lost", self.key);
        self.transition(ConnectionManager::lost);
        self.set_recording(false);
    }

    /// Connect, check the banner, subscribe to notifications, then read the
    /// initial transport status and clip list.
    async fn open_session(self: &Arc<Self>) -> Result<(), SyncError> {
        let addr = self.endpoint.addr();
        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SyncError::Timeout)??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let welcome = timeout(self.settings.command_timeout, read_response(&mut reader))
            .await
            .map_err(|_| SyncError::Timeout)??;
        let info = parse_welcome(&welcome)?;
        log::info!(
            "{}: connected to {} (protocol {})",
            self.key,
            info.model.as_deref().unwrap_or("unknown model"),
            info.protocol_version.as_deref().unwrap_or("?")
        );

        {
            let mut guard = self.session.lock().await;
            if util::read(&self.status).connection.is_stopped() {
                return Err(SyncError::Shutdown);
            }
            *guard = Some(Session::start(
                reader,
                write,
                Arc::downgrade(self),
                self.key.clone(),
            ));
        }

        if let Err(e) = self.send_command(&Command::subscribe_all()).await {
            self.session.lock().await.take();
            return Err(e);
        }

        util::write(&self.status).device_info = Some(info);
        self.transition(ConnectionManager::connected);

        if let Err(e) = self.query_transport().await {
            log::warn!("{}: cannot read transport status: {}", self.key, e);
        }
        if let Err(e) = self.list_clips().await {
            log::warn!("{}: cannot list clips: {}", self.key, e);
        }
        Ok(())
    }
}

/// Read one complete reply straight off the socket. Used for the welcome
/// banner, before the reader task owns the read half.
async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Response, SyncError> {
    let mut assembler = ResponseAssembler::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(SyncError::ConnectionClosed);
        }
        if let Some(response) = assembler.push(&line)? {
            return Ok(response);
        }
    }
}

async fn poll_loop(engine: Weak<EngineInner>, cancel: CancellationToken, key: String) {
    let mut cadence = {
        let Some(inner) = engine.upgrade() else { return };
        AdaptiveInterval::new(inner.settings.poll_interval, inner.settings.max_poll_interval)
            .with_threshold(POLL_ERROR_THRESHOLD)
    };
    let mut wait = cadence.current();

    log::debug!("{}: polling started", key);
    loop {
        if !sleep_cancellable(wait, &cancel).await {
            break;
        }
        let Some(inner) = engine.upgrade() else { break };

        if inner.session.lock().await.is_none() {
            let delay = inner.settings.reconnect_delay;
            log::info!("{}: reconnecting in {:?}", key, delay);
            drop(inner);
            if !sleep_cancellable(delay, &cancel).await {
                break;
            }
            let Some(inner) = engine.upgrade() else { break };
            match inner.open_session().await {
                Ok(()) => {
                    log::info!("{}: session restored", key);
                    wait = cadence.success();
                }
                Err(e) => {
                    log::warn!("{}: reconnect failed: {}", key, e);
                    inner.transition(ConnectionManager::lost);
                    wait = Duration::ZERO;
                }
            }
            continue;
        }

        wait = match inner.query_transport().await {
            Ok(_) => cadence.success(),
            Err(e) if e.is_transport() => {
                log::warn!("{}: status poll lost the session: {}", key, e);
                Duration::ZERO
            }
            Err(e) => {
                let next = cadence.failure();
                log::debug!("{}: status poll failed ({}), next in {:?}", key, e, next);
                next
            }
        };
        if cancel.is_cancelled() {
            break;
        }
    }
    log::debug!("{}: polling stopped", key);
}

#[cfg(all(test, feature = "emulator"))]
mod tests {
    use super::*;
    use crate::emulator::{unused_port, RecorderEmulator};
    use crate::events::testing::wait_for;
    use takesync_core::ProtocolError;
    use tokio_test::assert_err;

    /// Polling slow enough to stay out of the way of explicit commands.
    fn quiet() -> EngineSettings {
        EngineSettings {
            command_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_secs(60),
            max_poll_interval: Duration::from_secs(60),
            ..EngineSettings::default()
        }
    }

    async fn connected(emu: &RecorderEmulator, settings: EngineSettings) -> RecorderEngine {
        let engine = RecorderEngine::new(emu.endpoint(1), settings, EventBus::new());
        engine.connect().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_connect_subscribes_and_reads_initial_state() {
        let emu = RecorderEmulator::start("HyperDeck Studio").await.unwrap();
        let engine = connected(&emu, quiet()).await;

        assert!(engine.is_connected());
        assert_eq!(engine.state(), ConnectionState::Connected);
        let info = engine.device_info().unwrap();
        assert_eq!(info.model.as_deref(), Some("HyperDeck Studio"));
        assert_eq!(emu.count("notify"), 1);
        assert_eq!(emu.count("transport info"), 1);
        assert_eq!(emu.count("clips get"), 1);
        assert_eq!(
            engine.status().transport.unwrap().status(),
            Some("stopped")
        );

        // Connecting again is a no-op
        engine.connect().await.unwrap();
        assert_eq!(emu.count("notify"), 1);
    }

    #[tokio::test]
    async fn test_bad_welcome_is_rejected() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        emu.set_bad_welcome(true);
        let engine = RecorderEngine::new(emu.endpoint(1), quiet(), EventBus::new());

        let err = engine.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::BadWelcome(_))
        ));
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(emu.commands().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = unused_port().await;
        let endpoint = DeviceEndpoint::new(4, "127.0.0.1", port);
        let engine = RecorderEngine::new(endpoint, quiet(), EventBus::new());

        let err = engine.connect().await.unwrap_err();
        assert!(err.is_transport() || matches!(err, SyncError::Timeout));
        assert!(!engine.is_connected());
        assert!(matches!(
            engine.send_command(&Command::TransportInfo).await,
            Err(SyncError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_frees_the_slot() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let engine = connected(&emu, quiet()).await;

        emu.delay_next_reply(Duration::from_millis(450));
        let started = Instant::now();
        let err = engine.send_command(&Command::TransportInfo).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(engine.is_connected());

        // The late 208 is dropped; the next command gets its own reply
        let response = engine.send_command(&Command::ClipsGet).await.unwrap();
        assert_eq!(response.code, 205);
        let response = engine.send_command(&Command::TransportInfo).await.unwrap();
        assert_eq!(response.code, 208);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_answer_a_record() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let engine = connected(&emu, quiet()).await;

        emu.delay_next_reply(Duration::from_millis(450));
        assert_err!(engine.query_transport_status().await);

        emu.set_reject_record(true);
        let err = engine.start_recording(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Command { code: 104, .. }));
        assert!(!engine.is_recording());
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn test_notification_does_not_answer_a_command() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let engine = connected(&emu, quiet()).await;

        emu.set_push_before_reply(true);
        let response = engine.send_command(&Command::ClipsGet).await.unwrap();
        assert_eq!(response.code, 205);
        let response = engine.send_command(&Command::TransportInfo).await.unwrap();
        assert_eq!(response.code, 208);
    }

    #[tokio::test]
    async fn test_record_and_stop() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = RecorderEngine::new(emu.endpoint(1), quiet(), events);
        engine.connect().await.unwrap();

        // Not recording: stop never reaches the device
        engine.stop_recording().await.unwrap();
        assert_eq!(emu.count("stop"), 0);

        engine.start_recording(Some("Take_deck1")).await.unwrap();
        assert!(engine.is_recording());
        assert!(emu.is_recording());
        assert_eq!(emu.clips(), vec!["Take_deck1.mov".to_string()]);
        assert!(emu.commands().contains(&"record: name: Take_deck1".to_string()));
        // Let the device's own transport push land before stopping
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::RecorderStatus { status, .. } if status == "record")
        })
        .await;

        engine.stop_recording().await.unwrap();
        assert!(!engine.is_recording());
        assert!(!emu.is_recording());
        assert_eq!(emu.count("stop"), 1);

        let clips = engine.list_clips().await.unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].id, 1);
        assert_eq!(clips[0].name, "Take_deck1.mov");
    }

    #[tokio::test]
    async fn test_rejected_record() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let engine = connected(&emu, quiet()).await;

        emu.set_reject_record(true);
        let err = engine.start_recording(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Command { code: 104, .. }));
        assert!(!engine.is_recording());
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn test_front_panel_record_is_pushed() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = RecorderEngine::new(emu.endpoint(3), quiet(), events);
        engine.connect().await.unwrap();

        emu.set_recording_locally(true);
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::RecorderStatus { device: 3, status } if status == "record")
        })
        .await;
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::RecorderRecording { device: 3, recording: true })
        })
        .await;
        assert!(engine.is_recording());
    }

    #[tokio::test]
    async fn test_lost_session_is_reopened() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let settings = EngineSettings {
            command_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(100),
            ..EngineSettings::default()
        };
        let engine = RecorderEngine::new(emu.endpoint(1), settings, events);
        engine.connect().await.unwrap();

        emu.drop_connections();
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::RecorderState { state: ConnectionState::Reconnecting, .. })
        })
        .await;
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::RecorderState { state: ConnectionState::Connected, .. })
        })
        .await;
        assert!(engine.is_connected());
        assert_eq!(emu.count("notify"), 2);

        engine.disconnect().await.unwrap();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let emu = RecorderEmulator::start("HyperDeck").await.unwrap();
        let engine = connected(&emu, quiet()).await;
        engine.start_recording(None).await.unwrap();

        engine.disconnect().await.unwrap();
        engine.disconnect().await.unwrap();
        assert!(!engine.is_connected());
        assert!(!engine.is_recording());
        engine.stop_recording().await.unwrap();
        assert!(matches!(
            engine.send_command(&Command::Stop).await,
            Err(SyncError::NotConnected(_))
        ));

        engine.reconnect().await.unwrap();
        assert!(engine.is_connected());
    }
}

//! Link to the motion-capture controller.
//!
//! The controller runs as a local process and exposes a control API. The
//! [`CaptureSourceLink`] watches both: a process probe notices the process
//! disappearing or being restarted, an API probe notices the API going
//! silent. Both probes slow down while they keep failing.
//!
//! ```text
//!   NoProcess ──process found──► Disconnected ──connect──► Connected
//!       ▲                              ▲                       │
//!       │                       PID changed              probe failed
//!       │                              │                       ▼
//!       └────────process gone──────────┴──exhausted──── Reconnecting
//! ```
//!
//! All operations on the link run one at a time.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use takesync_core::tracking::{
    is_recording_state, take_name_or_placeholder, TAKE_NO_CONNECTION, TAKE_NO_RECORDING,
};
use takesync_core::{
    AdaptiveInterval, CaptureState, NameTracker, ProcessObservation, ProcessTracker,
    ReconnectPolicy,
};

use crate::error::{CaptureApiError, SyncError};
use crate::events::{ErrorSource, EventBus, SyncEvent};
use crate::util::{self, sleep_cancellable, CANCEL_TICK};

pub mod process;

pub use process::SysinfoProbe;

const KEY: &str = "Capture source";

/// Capture slot used for stop requests.
const STOP_SLOT: u32 = 0;

// =============================================================================
// Collaborators
// =============================================================================

/// Control API of the capture controller.
#[async_trait]
pub trait CaptureApi: Send + Sync {
    async fn current_capture_name(&self) -> Result<String, CaptureApiError>;
    async fn latest_capture_name(&self) -> Result<String, CaptureApiError>;
    /// Free-text capture state; see [`is_recording_state`]
    async fn latest_capture_state(&self) -> Result<String, CaptureApiError>;
    async fn start_capture(&self) -> Result<(), CaptureApiError>;
    async fn stop_capture(&self, slot: u32) -> Result<(), CaptureApiError>;
    async fn set_capture_name(&self, name: &str) -> Result<(), CaptureApiError>;
}

/// Opens API sessions to the controller.
#[async_trait]
pub trait CaptureConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CaptureApi>, CaptureApiError>;
}

/// Looks for the controller's OS process.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// PID of the controller process, if running
    async fn find(&self) -> Option<u32>;
}

/// Connector for a host without a control API client. The process is still
/// watched; every connect fails as unavailable.
pub struct DetachedConnector {
    host: String,
}

impl DetachedConnector {
    pub fn new(host: &str) -> Self {
        DetachedConnector {
            host: host.to_string(),
        }
    }
}

#[async_trait]
impl CaptureConnector for DetachedConnector {
    async fn connect(&self) -> Result<Arc<dyn CaptureApi>, CaptureApiError> {
        Err(CaptureApiError::Unavailable(format!(
            "no control API client for {}",
            self.host
        )))
    }
}

// =============================================================================
// Settings & status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    pub process_probe: Duration,
    pub process_probe_max: Duration,
    pub api_probe: Duration,
    pub api_probe_max: Duration,
    /// Consecutive API probe failures tolerated before the cadence slows down
    pub api_error_threshold: u32,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            process_probe: Duration::from_secs(2),
            process_probe_max: Duration::from_secs(5),
            api_probe: Duration::from_secs(1),
            api_probe_max: Duration::from_secs(5),
            api_error_threshold: 5,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Observable state of the link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub recording: bool,
    pub pid: Option<u32>,
    pub capture_name: Option<String>,
    pub take_name: Option<String>,
}

struct LinkInner {
    client: Option<Arc<dyn CaptureApi>>,
    process: ProcessTracker,
    names: NameTracker,
    /// Set when the process was restarted under an open session
    reconnect_pending: bool,
    process_cadence: AdaptiveInterval,
    api_cadence: AdaptiveInterval,
    next_process_check: Instant,
    next_api_check: Instant,
}

// =============================================================================
// Link
// =============================================================================

pub struct CaptureSourceLink {
    connector: Arc<dyn CaptureConnector>,
    probe: Arc<dyn ProcessProbe>,
    settings: LinkSettings,
    events: EventBus,
    cancel: CancellationToken,
    inner: tokio::sync::Mutex<LinkInner>,
    status: RwLock<CaptureStatus>,
}

impl CaptureSourceLink {
    pub fn new(
        connector: Arc<dyn CaptureConnector>,
        probe: Arc<dyn ProcessProbe>,
        settings: LinkSettings,
        events: EventBus,
    ) -> Self {
        let now = Instant::now();
        CaptureSourceLink {
            connector,
            probe,
            settings,
            events,
            cancel: CancellationToken::new(),
            inner: tokio::sync::Mutex::new(LinkInner {
                client: None,
                process: ProcessTracker::new(),
                names: NameTracker::new(),
                reconnect_pending: false,
                process_cadence: AdaptiveInterval::new(
                    settings.process_probe,
                    settings.process_probe_max,
                ),
                api_cadence: AdaptiveInterval::new(settings.api_probe, settings.api_probe_max)
                    .with_threshold(settings.api_error_threshold),
                next_process_check: now,
                next_api_check: now,
            }),
            status: RwLock::new(CaptureStatus::default()),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        util::read(&self.status).clone()
    }

    pub fn state(&self) -> CaptureState {
        util::read(&self.status).state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_recording(&self) -> bool {
        util::read(&self.status).recording
    }

    /// True while a PID change is waiting to be turned into a reconnect.
    pub async fn reconnect_scheduled(&self) -> bool {
        self.inner.lock().await.reconnect_pending
    }

    /// Stop the monitor loop and abort any backoff sleep.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // -------------------------------------------------------------------------
    // Monitoring
    // -------------------------------------------------------------------------

    /// Run both probes until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        log::info!("{}: monitor starting", KEY);
        loop {
            {
                let mut inner = self.inner.lock().await;
                if Instant::now() >= inner.next_process_check {
                    self.check_process_locked(&mut inner).await;
                }
                if inner.process.pid().is_some() && Instant::now() >= inner.next_api_check {
                    let wait = match self.probe_api_locked(&mut inner).await {
                        Ok(()) => inner.api_cadence.success(),
                        Err(e) => {
                            if matches!(e, SyncError::ReconnectExhausted { .. }) {
                                self.events.error(ErrorSource::CaptureSource, "reconnect", &e);
                            } else {
                                log::debug!("{}: API probe failed: {}", KEY, e);
                            }
                            inner.api_cadence.failure()
                        }
                    };
                    inner.next_api_check = Instant::now() + wait;
                }
            }
            if !sleep_cancellable(CANCEL_TICK, &self.cancel).await {
                break;
            }
        }
        log::info!("{}: monitor stopped", KEY);
    }

    /// One process-liveness probe.
    pub async fn check_process(&self) -> ProcessObservation {
        let mut inner = self.inner.lock().await;
        self.check_process_locked(&mut inner).await
    }

    /// One API-liveness probe: connects, reconnects or polls as needed.
    pub async fn probe_api(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        self.probe_api_locked(&mut inner).await
    }

    /// Connect if there is no session, otherwise verify the session answers.
    pub async fn ensure_connection(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        self.ensure_connection_locked(&mut inner).await
    }

    /// Drop the session and reconnect with exponential backoff.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        self.reconnect_locked(&mut inner).await
    }

    // -------------------------------------------------------------------------
    // Recording control
    // -------------------------------------------------------------------------

    /// Start a capture and return the controller's take name.
    ///
    /// Already recording is success; the running take's name is returned.
    pub async fn start_recording(&self) -> Result<String, SyncError> {
        let mut inner = self.inner.lock().await;
        let result = self.start_locked(&mut inner).await;
        if let Err(e) = &result {
            self.events.error(ErrorSource::CaptureSource, "start recording", e);
        }
        result
    }

    pub async fn stop_recording(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let result = self.stop_locked(&mut inner).await;
        if let Err(e) = &result {
            self.events.error(ErrorSource::CaptureSource, "stop recording", e);
        }
        result
    }

    /// Name the next capture. Our own change is not reported as an edge.
    pub async fn set_capture_name(&self, name: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let client = inner
            .client
            .clone()
            .ok_or_else(|| SyncError::NotConnected(KEY.to_string()))?;
        client.set_capture_name(name).await?;
        inner.names.assume(name);
        util::write(&self.status).capture_name = Some(name.to_string());
        log::info!("{}: capture name set to '{}'", KEY, name);
        Ok(())
    }

    async fn start_locked(&self, inner: &mut LinkInner) -> Result<String, SyncError> {
        self.ensure_connection_locked(inner).await?;
        let client = Self::client(inner)?;

        if Self::read_recording(&client).await {
            log::info!("{}: already recording", KEY);
            let name = client.latest_capture_name().await.unwrap_or_default();
            self.set_take_name(take_name_or_placeholder(&name));
            self.set_recording(true);
            return Ok(name);
        }

        self.call_with_retry(inner, |c| async move { c.start_capture().await })
            .await?;
        let client = Self::client(inner)?;
        let name = client.latest_capture_name().await.unwrap_or_default();
        log::info!("{}: recording started, take '{}'", KEY, name);
        self.set_take_name(take_name_or_placeholder(&name));
        self.set_recording(true);
        Ok(name)
    }

    async fn stop_locked(&self, inner: &mut LinkInner) -> Result<(), SyncError> {
        self.ensure_connection_locked(inner).await?;
        let client = Self::client(inner)?;

        if !Self::read_recording(&client).await {
            log::info!("{}: not recording", KEY);
            self.set_take_name(TAKE_NO_RECORDING);
            self.set_recording(false);
            return Ok(());
        }

        self.call_with_retry(inner, |c| async move { c.stop_capture(STOP_SLOT).await })
            .await?;
        log::info!("{}: recording stopped", KEY);
        self.set_take_name(TAKE_NO_RECORDING);
        self.set_recording(false);
        Ok(())
    }

    /// Run `call`; if the controller could not be reached, reconnect once and retry.
    async fn call_with_retry<T, F, Fut>(&self, inner: &mut LinkInner, call: F) -> Result<T, SyncError>
    where
        F: Fn(Arc<dyn CaptureApi>) -> Fut,
        Fut: Future<Output = Result<T, CaptureApiError>>,
    {
        let client = Self::client(inner)?;
        match call(client).await {
            Ok(v) => Ok(v),
            Err(CaptureApiError::Unavailable(cause)) => {
                log::warn!("{}: call failed ({}), reconnecting once", KEY, cause);
                self.reconnect_locked(inner).await?;
                let client = Self::client(inner)?;
                Ok(call(client).await?)
            }
            Err(rejected) => Err(rejected.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------------

    async fn check_process_locked(&self, inner: &mut LinkInner) -> ProcessObservation {
        let found = self.probe.find().await;
        let observation = inner.process.observe(found);
        util::write(&self.status).pid = found;

        let wait = match observation {
            ProcessObservation::Absent | ProcessObservation::Vanished { .. } => {
                if let ProcessObservation::Vanished { pid } = observation {
                    log::warn!("{}: controller process {} is gone", KEY, pid);
                }
                inner.client = None;
                inner.reconnect_pending = false;
                inner.names.clear();
                self.set_state(CaptureState::NoProcess);
                self.set_recording(false);
                self.set_take_name(TAKE_NO_CONNECTION);
                inner.process_cadence.failure()
            }
            ProcessObservation::Appeared { pid } => {
                log::info!("{}: controller process found (PID {})", KEY, pid);
                self.set_state(CaptureState::Disconnected);
                inner.next_api_check = Instant::now();
                inner.process_cadence.success()
            }
            ProcessObservation::Present { .. } => inner.process_cadence.success(),
            ProcessObservation::Restarted { previous, pid } => {
                log::info!("{}: controller restarted (PID {} -> {})", KEY, previous, pid);
                if inner.client.take().is_some() || self.is_connected() {
                    inner.reconnect_pending = true;
                    inner.next_api_check = Instant::now();
                }
                self.set_state(CaptureState::Disconnected);
                self.set_recording(false);
                inner.process_cadence.success()
            }
        };
        inner.next_process_check = Instant::now() + wait;
        observation
    }

    async fn probe_api_locked(&self, inner: &mut LinkInner) -> Result<(), SyncError> {
        if inner.process.pid().is_none() {
            return Err(SyncError::ProcessNotFound);
        }
        if inner.reconnect_pending {
            inner.reconnect_pending = false;
            return self.reconnect_locked(inner).await;
        }
        let Some(client) = inner.client.clone() else {
            return self.connect_locked(inner).await;
        };
        match client.latest_capture_state().await {
            Ok(state) => {
                self.set_recording(is_recording_state(&state));
                self.refresh_names(inner, &client).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("{}: controller stopped answering: {}", KEY, e);
                self.reconnect_locked(inner).await
            }
        }
    }

    async fn ensure_connection_locked(&self, inner: &mut LinkInner) -> Result<(), SyncError> {
        let Some(client) = inner.client.clone() else {
            return self.connect_locked(inner).await;
        };
        match client.latest_capture_state().await {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("{}: liveness probe failed: {}", KEY, e);
                self.reconnect_locked(inner).await
            }
        }
    }

    /// Single connect attempt.
    async fn connect_locked(&self, inner: &mut LinkInner) -> Result<(), SyncError> {
        if inner.process.pid().is_none() && !self.check_process_locked(inner).await.is_running() {
            return Err(SyncError::ProcessNotFound);
        }
        self.set_state(CaptureState::Connecting);
        match self.connector.connect().await {
            Ok(client) => {
                self.adopt(inner, client).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("{}: connect failed: {}", KEY, e);
                self.set_state(CaptureState::Disconnected);
                Err(e.into())
            }
        }
    }

    async fn reconnect_locked(&self, inner: &mut LinkInner) -> Result<(), SyncError> {
        inner.client = None;
        self.set_state(CaptureState::Reconnecting);
        let policy = self.settings.reconnect;
        log::info!("{}: reconnecting (up to {} attempts)", KEY, policy.max_attempts);

        for attempt in 1..=policy.max_attempts {
            if self.cancel.is_cancelled() {
                self.set_state(CaptureState::Disconnected);
                return Err(SyncError::Shutdown);
            }
            match self.connector.connect().await {
                Ok(client) => {
                    log::info!("{}: reconnected on attempt {}", KEY, attempt);
                    self.adopt(inner, client).await;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("{}: reconnect attempt {} failed: {}", KEY, attempt, e);
                }
            }
            if attempt < policy.max_attempts {
                let delay = policy.delay(attempt);
                log::debug!("{}: next attempt in {:?}", KEY, delay);
                self.backoff_locked(inner, delay).await?;
            }
        }

        log::error!(
            "{}: giving up after {} reconnect attempts",
            KEY,
            policy.max_attempts
        );
        self.set_state(CaptureState::Disconnected);
        Err(SyncError::ReconnectExhausted {
            attempts: policy.max_attempts,
        })
    }

    /// Wait out one backoff delay. The process probe keeps its own cadence
    /// meanwhile; the cycle ends early if the controller process goes away.
    async fn backoff_locked(&self, inner: &mut LinkInner, delay: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + delay;
        loop {
            if Instant::now() >= inner.next_process_check {
                match self.check_process_locked(inner).await {
                    ProcessObservation::Absent | ProcessObservation::Vanished { .. } => {
                        log::info!("{}: reconnect abandoned, no controller process", KEY);
                        return Err(SyncError::ProcessNotFound);
                    }
                    ProcessObservation::Restarted { .. } => {
                        self.set_state(CaptureState::Reconnecting)
                    }
                    _ => {}
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if !sleep_cancellable((deadline - now).min(CANCEL_TICK), &self.cancel).await {
                self.set_state(CaptureState::Disconnected);
                return Err(SyncError::Shutdown);
            }
        }
    }

    /// Install a fresh API session and read its recording state.
    async fn adopt(&self, inner: &mut LinkInner, client: Arc<dyn CaptureApi>) {
        inner.client = Some(client.clone());
        inner.reconnect_pending = false;
        self.set_state(CaptureState::Connected);
        self.set_recording(Self::read_recording(&client).await);
        self.refresh_names(inner, &client).await;
    }

    async fn refresh_names(&self, inner: &mut LinkInner, client: &Arc<dyn CaptureApi>) {
        match client.current_capture_name().await {
            Ok(name) => {
                if let Some(changed) = inner.names.observe(&name) {
                    log::info!("{}: capture name is now '{}'", KEY, changed);
                    util::write(&self.status).capture_name = Some(changed.clone());
                    self.events
                        .emit(SyncEvent::CaptureNameChanged { name: changed });
                }
            }
            Err(e) => log::debug!("{}: cannot read capture name: {}", KEY, e),
        }
        if self.is_recording() {
            if let Ok(name) = client.latest_capture_name().await {
                self.set_take_name(take_name_or_placeholder(&name));
            }
        }
    }

    async fn read_recording(client: &Arc<dyn CaptureApi>) -> bool {
        matches!(client.latest_capture_state().await, Ok(state) if is_recording_state(&state))
    }

    fn client(inner: &LinkInner) -> Result<Arc<dyn CaptureApi>, SyncError> {
        inner
            .client
            .clone()
            .ok_or_else(|| SyncError::NotConnected(KEY.to_string()))
    }

    // -------------------------------------------------------------------------
    // Edge-triggered status updates
    // -------------------------------------------------------------------------

    fn set_state(&self, state: CaptureState) {
        let changed = {
            let mut status = util::write(&self.status);
            std::mem::replace(&mut status.state, state) != state
        };
        if changed {
            log::info!("{}: {}", KEY, state);
            self.events.emit(SyncEvent::CaptureState { state });
        }
    }

    fn set_recording(&self, recording: bool) {
        let changed = {
            let mut status = util::write(&self.status);
            std::mem::replace(&mut status.recording, recording) != recording
        };
        if changed {
            self.events.emit(SyncEvent::CaptureRecording { recording });
        }
    }

    fn set_take_name(&self, name: &str) {
        let changed = {
            let mut status = util::write(&self.status);
            if status.take_name.as_deref() == Some(name) {
                false
            } else {
                status.take_name = Some(name.to_string());
                true
            }
        };
        if changed {
            self.events.emit(SyncEvent::TakeName {
                name: name.to_string(),
            });
        }
    }
}

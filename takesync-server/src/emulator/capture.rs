use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::capture::{CaptureApi, CaptureConnector, ProcessProbe};
use crate::error::CaptureApiError;
use crate::util;

struct State {
    pid: Mutex<Option<u32>>,
    api_up: AtomicBool,
    recording: AtomicBool,
    capture_name: Mutex<String>,
    latest_take: Mutex<String>,
    takes: AtomicU32,
    reject_start: AtomicBool,
    /// Number of upcoming API calls that fail as unreachable
    fail_calls: AtomicU32,
    connects: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
}

/// Capture controller emulation: process, connector and API in one.
///
/// Clones share state, so a test can keep one handle to steer the
/// emulation while the link owns another.
#[derive(Clone)]
pub struct EmulatedCapture {
    state: Arc<State>,
}

impl Default for EmulatedCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedCapture {
    /// A running controller (PID 4242) with a reachable API.
    pub fn new() -> Self {
        EmulatedCapture {
            state: Arc::new(State {
                pid: Mutex::new(Some(4242)),
                api_up: AtomicBool::new(true),
                recording: AtomicBool::new(false),
                capture_name: Mutex::new("Take".to_string()),
                latest_take: Mutex::new(String::new()),
                takes: AtomicU32::new(0),
                reject_start: AtomicBool::new(false),
                fail_calls: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
            }),
        }
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *util::lock(&self.state.pid) = pid;
    }

    /// API reachable or not; connects fail too while it is down.
    pub fn set_api_up(&self, up: bool) {
        self.state.api_up.store(up, Ordering::SeqCst);
    }

    pub fn set_reject_start(&self, on: bool) {
        self.state.reject_start.store(on, Ordering::SeqCst);
    }

    /// Make the next `n` API calls fail as unreachable.
    pub fn fail_next_calls(&self, n: u32) {
        self.state.fail_calls.store(n, Ordering::SeqCst);
    }

    /// Rename the capture as an operator would in the controller's UI.
    pub fn rename(&self, name: &str) {
        *util::lock(&self.state.capture_name) = name.to_string();
    }

    /// Start or stop recording from the controller side.
    pub fn set_recording_locally(&self, recording: bool) {
        if recording {
            self.new_take();
        }
        self.state.recording.store(recording, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.state.recording.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.state.stops.load(Ordering::SeqCst)
    }

    fn new_take(&self) {
        let n = self.state.takes.fetch_add(1, Ordering::SeqCst) + 1;
        let base = util::lock(&self.state.capture_name).clone();
        *util::lock(&self.state.latest_take) = format!("{}_{:03}", base, n);
    }

    fn check(&self) -> Result<(), CaptureApiError> {
        if !self.state.api_up.load(Ordering::SeqCst) {
            return Err(CaptureApiError::Unavailable("API not answering".into()));
        }
        let pending = self.state.fail_calls.load(Ordering::SeqCst);
        if pending > 0 {
            self.state.fail_calls.store(pending - 1, Ordering::SeqCst);
            return Err(CaptureApiError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureApi for EmulatedCapture {
    async fn current_capture_name(&self) -> Result<String, CaptureApiError> {
        self.check()?;
        Ok(util::lock(&self.state.capture_name).clone())
    }

    async fn latest_capture_name(&self) -> Result<String, CaptureApiError> {
        self.check()?;
        Ok(util::lock(&self.state.latest_take).clone())
    }

    async fn latest_capture_state(&self) -> Result<String, CaptureApiError> {
        self.check()?;
        Ok(if self.is_recording() { "Started" } else { "Stopped" }.to_string())
    }

    async fn start_capture(&self) -> Result<(), CaptureApiError> {
        self.check()?;
        if self.state.reject_start.load(Ordering::SeqCst) {
            return Err(CaptureApiError::Rejected("no capture slot armed".into()));
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.set_recording_locally(true);
        Ok(())
    }

    async fn stop_capture(&self, _slot: u32) -> Result<(), CaptureApiError> {
        self.check()?;
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.set_recording_locally(false);
        Ok(())
    }

    async fn set_capture_name(&self, name: &str) -> Result<(), CaptureApiError> {
        self.check()?;
        self.rename(name);
        Ok(())
    }
}

#[async_trait]
impl CaptureConnector for EmulatedCapture {
    async fn connect(&self) -> Result<Arc<dyn CaptureApi>, CaptureApiError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if util::lock(&self.state.pid).is_none() {
            return Err(CaptureApiError::Unavailable("controller not running".into()));
        }
        if !self.state.api_up.load(Ordering::SeqCst) {
            return Err(CaptureApiError::Unavailable("connection refused".into()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ProcessProbe for EmulatedCapture {
    async fn find(&self) -> Option<u32> {
        *util::lock(&self.state.pid)
    }
}

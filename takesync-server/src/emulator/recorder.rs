use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use takesync_core::protocol::DEFAULT_PORT;
use takesync_core::DeviceEndpoint;

use crate::util;

const PROTOCOL_VERSION: &str = "1.11";

#[derive(Default)]
struct Faults {
    reject_record: AtomicBool,
    /// Hold back the next reply this long
    delay_next: Mutex<Option<Duration>>,
    bad_welcome: AtomicBool,
    push_before_reply: AtomicBool,
}

struct State {
    model: String,
    recording: AtomicBool,
    clips: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    faults: Faults,
    /// Unsolicited 5xx pushes, delivered to subscribed sessions
    pushes: broadcast::Sender<String>,
    /// Cancelling closes every open session; replaced afterwards
    kick: Mutex<CancellationToken>,
}

impl State {
    fn transport_block(&self, code: u16) -> String {
        let status = if self.recording.load(Ordering::SeqCst) {
            "record"
        } else {
            "stopped"
        };
        let clip_id = util::lock(&self.clips).len();
        format!(
            "{} transport info:\r\nstatus: {}\r\nspeed: 0\r\nslot id: 1\r\nclip id: {}\r\n\r\n",
            code, status, clip_id
        )
    }

    fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::SeqCst);
        let _ = self.pushes.send(self.transport_block(508));
    }
}

/// Emulated network recorder listening on a local port.
pub struct RecorderEmulator {
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
}

impl RecorderEmulator {
    /// Listen on an ephemeral localhost port.
    pub async fn start(model: &str) -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0", model).await
    }

    pub async fn bind(addr: &str, model: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (pushes, _) = broadcast::channel(16);
        let state = Arc::new(State {
            model: model.to_string(),
            recording: AtomicBool::new(false),
            clips: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            faults: Faults::default(),
            pushes,
            kick: Mutex::new(CancellationToken::new()),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, state.clone(), cancel.clone()));
        log::debug!("recorder emulator '{}' on {}", model, addr);
        Ok(RecorderEmulator {
            addr,
            state,
            cancel,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self, id: u32) -> DeviceEndpoint {
        DeviceEndpoint::new(id, &self.addr.ip().to_string(), self.addr.port())
    }

    pub fn is_recording(&self) -> bool {
        self.state.recording.load(Ordering::SeqCst)
    }

    /// Every command received so far, multi-line blocks by their header.
    pub fn commands(&self) -> Vec<String> {
        util::lock(&self.state.commands).clone()
    }

    pub fn count(&self, command: &str) -> usize {
        util::lock(&self.state.commands)
            .iter()
            .filter(|c| c.as_str() == command || c.starts_with(&format!("{}:", command)))
            .count()
    }

    pub fn clear_commands(&self) {
        util::lock(&self.state.commands).clear();
    }

    pub fn clips(&self) -> Vec<String> {
        util::lock(&self.state.clips).clone()
    }

    /// Answer record requests with `104 disk full`.
    pub fn set_reject_record(&self, on: bool) {
        self.state.faults.reject_record.store(on, Ordering::SeqCst);
    }

    /// Answer the next command only after `delay`. Commands behind it queue
    /// up and are answered in order.
    pub fn delay_next_reply(&self, delay: Duration) {
        *util::lock(&self.state.faults.delay_next) = Some(delay);
    }

    /// Greet new sessions with `200 ok` instead of the 5xx banner.
    pub fn set_bad_welcome(&self, on: bool) {
        self.state.faults.bad_welcome.store(on, Ordering::SeqCst);
    }

    /// Send a `508` transport push in front of every reply.
    pub fn set_push_before_reply(&self, on: bool) {
        self.state.faults.push_before_reply.store(on, Ordering::SeqCst);
    }

    /// Change the transport as if someone pressed the front-panel button.
    pub fn set_recording_locally(&self, recording: bool) {
        self.state.set_recording(recording);
    }

    /// Close every open session. The listener keeps accepting.
    pub fn drop_connections(&self) {
        let mut kick = util::lock(&self.state.kick);
        kick.cancel();
        *kick = CancellationToken::new();
    }

    pub fn shutdown(&self) {
        self.drop_connections();
        self.cancel.cancel();
    }
}

impl Drop for RecorderEmulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A localhost port nobody listens on.
pub async fn unused_port() -> u16 {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l.local_addr().map(|a| a.port()).unwrap_or(DEFAULT_PORT),
        Err(_) => DEFAULT_PORT,
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("emulator {}: session from {}", state.model, peer);
                    tokio::spawn(serve(stream, state.clone()));
                }
                Err(e) => log::warn!("emulator accept failed: {}", e),
            }
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let kick = util::lock(&state.kick).clone();
    let mut pushes = state.pushes.subscribe();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let welcome = if state.faults.bad_welcome.load(Ordering::SeqCst) {
        "200 ok\r\n".to_string()
    } else {
        format!(
            "500 connection info:\r\nprotocol version: {}\r\nmodel: {}\r\n\r\n",
            PROTOCOL_VERSION, state.model
        )
    };
    if write.write_all(welcome.as_bytes()).await.is_err() {
        return;
    }

    let mut subscribed = false;
    let mut block: Option<String> = None;

    loop {
        // Pushes go out before the next request is read, as on the hardware
        tokio::select! {
            biased;
            _ = kick.cancelled() => break,
            push = pushes.recv() => {
                if let Ok(text) = push {
                    if subscribed && write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let line = line.trim().to_string();

                // Multi-line requests run from "header:" to a blank line
                let request = match block.take() {
                    Some(header) if line.is_empty() => header,
                    Some(header) => {
                        block = Some(header);
                        continue;
                    }
                    None if line.is_empty() => continue,
                    None if line.ends_with(':') => {
                        block = Some(line);
                        continue;
                    }
                    None => line,
                };

                if request == "notify:" {
                    subscribed = true;
                }
                if respond(&state, &request, &mut write).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn respond(state: &State, request: &str, write: &mut OwnedWriteHalf) -> std::io::Result<()> {
    util::lock(&state.commands).push(request.to_string());

    let delay = util::lock(&state.faults.delay_next).take();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if state.faults.push_before_reply.load(Ordering::SeqCst) {
        write.write_all(state.transport_block(508).as_bytes()).await?;
    }

    let reply = match request {
        "record" => record(state, None),
        r if r.starts_with("record:") => {
            let name = r.rsplit_once("name:").map(|(_, n)| n.trim().to_string());
            record(state, name)
        }
        "stop" => {
            state.set_recording(false);
            "200 ok\r\n".to_string()
        }
        "transport info" => state.transport_block(208),
        "clips get" => {
            let clips = util::lock(&state.clips);
            let mut reply = format!("205 clips info:\r\nclip count: {}\r\n", clips.len());
            for (i, name) in clips.iter().enumerate() {
                reply.push_str(&format!("{}: {} 00:00:00:00 00:00:10:00\r\n", i + 1, name));
            }
            reply.push_str("\r\n");
            reply
        }
        "notify:" => "200 ok\r\n".to_string(),
        _ => "100 syntax error\r\n".to_string(),
    };
    write.write_all(reply.as_bytes()).await
}

fn record(state: &State, name: Option<String>) -> String {
    if state.faults.reject_record.load(Ordering::SeqCst) {
        return "104 disk full\r\n".to_string();
    }
    {
        let mut clips = util::lock(&state.clips);
        let name = name.unwrap_or_else(|| format!("Clip_{:03}", clips.len() + 1));
        clips.push(format!("{}.mov", name));
    }
    state.set_recording(true);
    "200 ok\r\n".to_string()
}

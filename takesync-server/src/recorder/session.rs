//! One TCP session with a recorder: the write half, the single pending
//! command slot, and the task that reads and dispatches replies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use takesync_core::protocol::report::is_transport_info;
use takesync_core::protocol::{ReplyClass, Response, ResponseAssembler, TransportInfo, LINE_END};

use super::EngineInner;
use crate::error::SyncError;
use crate::util;

/// The one command allowed in flight on a session.
pub(crate) struct PendingCommand {
    pub text: String,
    pub reply: oneshot::Sender<Response>,
    pub deadline: Instant,
}

/// The pending command plus the replies still owed to commands that timed out.
///
/// The protocol carries no correlation ids, so the next `owed` non-5xx
/// replies belong to abandoned commands and are discarded.
#[derive(Default)]
struct Slot {
    command: Option<PendingCommand>,
    owed: usize,
}

impl Slot {
    fn abandon(&mut self) -> Option<PendingCommand> {
        let cmd = self.command.take();
        if cmd.is_some() {
            self.owed += 1;
        }
        cmd
    }
}

type PendingSlot = Arc<Mutex<Slot>>;

pub(crate) struct Session {
    writer: OwnedWriteHalf,
    pending: PendingSlot,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Session {
    pub fn start(
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        engine: Weak<EngineInner>,
        key: String,
    ) -> Session {
        let pending: PendingSlot = Arc::new(Mutex::new(Slot::default()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            alive.clone(),
            engine,
            key,
        ));
        Session {
            writer,
            pending,
            alive,
            reader,
        }
    }

    /// False once the reader saw EOF or a socket error.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Register `text` as the pending command and write it.
    ///
    /// The caller holds the engine's session lock, so the slot is always free here.
    pub async fn send(
        &mut self,
        text: String,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Response>, SyncError> {
        let (tx, rx) = oneshot::channel();
        let line = format!("{}{}", text, LINE_END);
        {
            let mut slot = util::lock(&self.pending);
            if let Some(stale) = slot.abandon() {
                log::debug!("dropping stale pending command '{}'", stale.text);
            }
            slot.command = Some(PendingCommand {
                text,
                reply: tx,
                deadline,
            });
        }
        self.writer.write_all(line.as_bytes()).await?;
        Ok(rx)
    }

    /// Clear the pending slot after a timeout so the next command can go out.
    ///
    /// The device still owes a reply to the abandoned command; the reader
    /// drops it when it arrives.
    pub fn clear_pending(&self) -> Option<String> {
        util::lock(&self.pending).abandon().map(|p| p.text)
    }

    /// Replies still expected for commands that timed out.
    pub fn owed_replies(&self) -> usize {
        util::lock(&self.pending).owed
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: PendingSlot,
    alive: Arc<AtomicBool>,
    engine: Weak<EngineInner>,
    key: String,
) {
    let mut assembler = ResponseAssembler::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                log::info!("{}: connection closed by device", key);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("{}: read error: {}", key, e);
                break;
            }
        }
        log::trace!("{}: << {}", key, line.trim_end());

        let response = match assembler.push(&line) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("{}: {}", key, e);
                continue;
            }
        };

        match response.class() {
            ReplyClass::Notification => {
                if is_transport_info(&response) {
                    if let Some(engine) = engine.upgrade() {
                        engine.apply_transport(TransportInfo::from_response(&response));
                    }
                } else {
                    log::debug!("{}: notification {}", key, response);
                }
            }
            ReplyClass::Error | ReplyClass::Success => {
                let waiting = {
                    let mut slot = util::lock(&pending);
                    if slot.owed > 0 {
                        slot.owed -= 1;
                        log::debug!("{}: dropping late reply {}", key, response);
                        continue;
                    }
                    slot.command.take()
                };
                match waiting {
                    Some(cmd) => {
                        if Instant::now() > cmd.deadline {
                            log::debug!("{}: reply to '{}' after its deadline", key, cmd.text);
                        }
                        let _ = cmd.reply.send(response);
                    }
                    None => log::warn!("{}: unsolicited reply {}", key, response),
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
    // Dropping the sender wakes the waiting command with a closed channel
    util::lock(&pending).command.take();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> (PendingCommand, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        let cmd = PendingCommand {
            text: text.to_string(),
            reply,
            deadline: Instant::now(),
        };
        (cmd, rx)
    }

    #[test]
    fn test_abandoned_commands_are_owed_a_reply() {
        let mut slot = Slot::default();
        assert!(slot.abandon().is_none());
        assert_eq!(slot.owed, 0);

        let (cmd, _rx) = command("transport info");
        slot.command = Some(cmd);
        assert_eq!(slot.abandon().map(|c| c.text).as_deref(), Some("transport info"));
        assert_eq!(slot.owed, 1);
        assert!(slot.command.is_none());
    }
}

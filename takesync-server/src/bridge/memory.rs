use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use super::{MessageHandler, MessageTransport, MessageValue};
use crate::error::SyncError;
use crate::util;

/// In-process transport.
///
/// Inbound messages are injected with [`deliver`](Self::deliver). Outbound
/// messages are kept in order, or only written to the log when the transport
/// was built with [`logging`](Self::logging). The binary uses the logging
/// form to drive the bridge from its console.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: RwLock<HashMap<String, MessageHandler>>,
    sent: Mutex<Vec<(String, MessageValue)>>,
    log_outbound: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that logs every outbound message at info level and keeps none.
    pub fn logging() -> Self {
        MemoryTransport {
            log_outbound: true,
            ..Self::default()
        }
    }

    /// Dispatch an inbound message. Returns false when nothing handles `address`.
    pub fn deliver(&self, address: &str, args: &[MessageValue]) -> bool {
        let handler = util::read(&self.handlers).get(address).cloned();
        match handler {
            Some(handler) => {
                handler(args);
                true
            }
            None => {
                log::warn!("no handler for {}", address);
                false
            }
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = util::read(&self.handlers).keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn sent(&self) -> Vec<(String, MessageValue)> {
        util::lock(&self.sent).clone()
    }

    /// Outbound messages sent to one address.
    pub fn sent_to(&self, address: &str) -> Vec<MessageValue> {
        util::lock(&self.sent)
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl MessageTransport for MemoryTransport {
    fn register_handler(&self, address: &str, handler: MessageHandler) {
        util::write(&self.handlers).insert(address.to_string(), handler);
    }

    fn send_message(&self, address: &str, value: MessageValue) -> Result<(), SyncError> {
        if self.log_outbound {
            log::info!("-> {} {:?}", address, value);
        } else {
            util::lock(&self.sent).push((address.to_string(), value));
        }
        Ok(())
    }
}

//! Request formatting.
//!
//! Requests are written as text followed by [`LINE_END`](super::LINE_END).
//! The engine appends the terminator; [`Command::to_wire`] returns the body.

use serde::{Deserialize, Serialize};

/// Requests the bridge sends to a recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start recording, optionally naming the clip
    Record { name: Option<String> },
    /// Stop recording
    Stop,
    /// Query transport status (reply 208)
    TransportInfo,
    /// List clips on the active slot (reply 205)
    ClipsGet,
    /// Subscribe to asynchronous notifications
    Notify {
        slot: bool,
        remote: bool,
        configuration: bool,
    },
}

impl Command {
    pub fn record(name: Option<&str>) -> Self {
        Command::Record {
            name: name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        }
    }

    /// Subscription used right after the welcome banner.
    pub fn subscribe_all() -> Self {
        Command::Notify {
            slot: true,
            remote: true,
            configuration: true,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Command::Record { name: None } => "record".to_string(),
            Command::Record { name: Some(name) } => format!("record: name: {}", name),
            Command::Stop => "stop".to_string(),
            Command::TransportInfo => "transport info".to_string(),
            Command::ClipsGet => "clips get".to_string(),
            Command::Notify {
                slot,
                remote,
                configuration,
            } => format!(
                "notify:\nslot: {}\nremote: {}\nconfiguration: {}\n\n",
                slot, remote, configuration
            ),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Multi-line commands are logged by their first line only
        let wire = self.to_wire();
        write!(f, "{}", wire.lines().next().unwrap_or_default())
    }
}

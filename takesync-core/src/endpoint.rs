//! Declarative device list and the reconcile planner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::DEFAULT_PORT;

pub type DeviceId = u32;

/// One configured recorder.
///
/// Compared by value: any field change between two configuration passes is
/// a change of endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub id: DeviceId,
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_enabled() -> bool {
    true
}

impl DeviceEndpoint {
    pub fn new(id: DeviceId, host: &str, port: u16) -> Self {
        DeviceEndpoint {
            id,
            host: host.to_string(),
            port,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `host:port` for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prefix used in log lines.
    pub fn key(&self) -> String {
        format!("Recorder {} ({})", self.id, self.addr())
    }

    /// True if switching from `self` to `other` needs a new session.
    pub fn moved(&self, other: &DeviceEndpoint) -> bool {
        self.host != other.host || self.port != other.port
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// What has to happen to turn the live engine set into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Engines whose endpoint was removed or disabled
    pub remove: Vec<DeviceId>,
    /// Engines whose host or port changed; disconnect, then connect to the new endpoint
    pub restart: Vec<DeviceEndpoint>,
    /// New enabled endpoints to connect
    pub add: Vec<DeviceEndpoint>,
}

impl ReconcilePlan {
    /// Compute the plan. On duplicate ids in `desired` the last entry wins.
    pub fn compute(current: &[DeviceEndpoint], desired: &[DeviceEndpoint]) -> Self {
        let desired: BTreeMap<DeviceId, &DeviceEndpoint> =
            desired.iter().map(|e| (e.id, e)).collect();
        let live: BTreeMap<DeviceId, &DeviceEndpoint> =
            current.iter().map(|e| (e.id, e)).collect();

        let mut plan = ReconcilePlan::default();
        for (id, have) in &live {
            match desired.get(id) {
                None => plan.remove.push(*id),
                Some(want) if !want.enabled => plan.remove.push(*id),
                Some(want) if have.moved(want) => plan.restart.push((*want).clone()),
                Some(_) => {}
            }
        }
        for (id, want) in &desired {
            if want.enabled && !live.contains_key(id) {
                plan.add.push((*want).clone());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.restart.is_empty() && self.add.is_empty()
    }
}

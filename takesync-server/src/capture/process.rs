//! Controller process detection through `sysinfo`.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::System;

use super::ProcessProbe;
use crate::util;

/// Finds the controller by process-name substring.
///
/// When several processes match, the lowest PID wins so repeated scans stay
/// stable.
pub struct SysinfoProbe {
    names: Arc<Vec<String>>,
    system: Arc<Mutex<System>>,
}

impl SysinfoProbe {
    pub fn new(names: &[String]) -> Self {
        SysinfoProbe {
            names: Arc::new(names.to_vec()),
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

#[async_trait]
impl ProcessProbe for SysinfoProbe {
    async fn find(&self) -> Option<u32> {
        let names = self.names.clone();
        let system = self.system.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let mut sys = util::lock(&system);
            sys.refresh_processes();
            sys.processes()
                .iter()
                .filter(|(_, p)| names.iter().any(|n| p.name().contains(n.as_str())))
                .map(|(pid, _)| pid.as_u32())
                .min()
        });
        match scan.await {
            Ok(pid) => pid,
            Err(e) => {
                log::warn!("process scan failed: {}", e);
                None
            }
        }
    }
}

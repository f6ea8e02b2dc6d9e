//! # takesync server
//!
//! Starts and stops a motion-capture controller and a set of networked tape
//! recorders as one take.
//!
//! ```text
//!   inbound ───► MessageBridge ───► RecordingOrchestrator
//!                    │   ▲                │          │
//!   outbound ◄───────┘   │                ▼          ▼
//!                        │     CaptureSourceLink   RecorderFleet
//!                        │           │       │       │       │
//!                        └─ EventBus ◄───────┼───────┘       │
//!                                            ▼               ▼
//!                                  controller process   RecorderEngine × n
//!                                  and control API      (TCP text protocol)
//! ```
//!
//! ## Key Components
//!
//! - [`recorder::RecorderEngine`] - one TCP session per recorder, one command in flight
//! - [`recorder::RecorderFleet`] - concurrent fan-out, all-or-nothing start
//! - [`capture::CaptureSourceLink`] - process and API liveness, reconnect with backoff
//! - [`orchestrator::RecordingOrchestrator`] - synchronised start/stop
//! - [`bridge::MessageBridge`] - address-based control messages in and out
//! - [`Session`] - wires the above into graceful-shutdown subsystems
//!
//! ## Command-Line Interface
//!
//! See [`Cli`]. Key options:
//!
//! - `-c, --config` - settings file (default: the platform config directory)
//! - `--emulate` - run against in-process emulators instead of hardware
//! - `--write-config` - write the effective settings and exit
//! - `-v` - increase verbosity (use multiple times)

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub mod bridge;
pub mod capture;
pub mod config;
#[cfg(feature = "emulator")]
pub mod emulator;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recorder;
mod util;

use bridge::{MemoryTransport, MessageBridge, MessageValue};
use capture::{
    CaptureConnector, CaptureSourceLink, DetachedConnector, ProcessProbe, SysinfoProbe,
};
use config::AppConfig;
use error::SyncError;
use events::EventBus;
use orchestrator::RecordingOrchestrator;
use recorder::RecorderFleet;
use takesync_core::DeviceEndpoint;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run against in-process recorder and capture-controller emulators
    #[arg(long, default_value_t = false)]
    pub emulate: bool,

    /// Write the effective settings to the settings file and exit
    #[arg(long, default_value_t = false)]
    pub write_config: bool,
}

/// The running bridge.
///
/// Owns every link. [`Session::new`] starts the long-running parts as
/// subsystems of the caller's graceful-shutdown tree.
#[derive(Clone)]
pub struct Session {
    pub config: Arc<AppConfig>,
    pub events: EventBus,
    pub capture: Arc<CaptureSourceLink>,
    pub fleet: Arc<RecorderFleet>,
    pub orchestrator: Arc<RecordingOrchestrator>,
    pub transport: Arc<MemoryTransport>,
}

impl Session {
    pub async fn new(
        subsystem: &SubsystemHandle,
        args: Cli,
        config: AppConfig,
    ) -> Result<Self, SyncError> {
        let events = EventBus::new();

        let (connector, probe, devices) = if args.emulate {
            emulated(subsystem, &config).await?
        } else {
            log::warn!("{}", detached_warning(&config.capture.host));
            let connector: Arc<dyn CaptureConnector> =
                Arc::new(DetachedConnector::new(&config.capture.host));
            let probe: Arc<dyn ProcessProbe> =
                Arc::new(SysinfoProbe::new(&config.capture.process_names));
            (connector, probe, config.active_devices())
        };

        let capture = Arc::new(CaptureSourceLink::new(
            connector,
            probe,
            config.link_settings(),
            events.clone(),
        ));
        let fleet = Arc::new(RecorderFleet::new(config.engine_settings(), events.clone()));
        let orchestrator = Arc::new(RecordingOrchestrator::new(
            capture.clone(),
            fleet.clone(),
            config.orchestrator_settings(),
            events.clone(),
        ));
        let transport = Arc::new(MemoryTransport::logging());
        log::info!(
            "message bridge: listen {}, outbound {}",
            config.bridge.listen,
            config.bridge.broadcast
        );

        let session = Session {
            config: Arc::new(config),
            events,
            capture,
            fleet,
            orchestrator,
            transport,
        };
        session.start(subsystem, devices);
        Ok(session)
    }

    fn start(&self, subsystem: &SubsystemHandle, devices: Vec<DeviceEndpoint>) {
        let capture = self.capture.clone();
        subsystem.start(SubsystemBuilder::new("CaptureMonitor", |subsys| async move {
            let run = capture.run();
            tokio::pin!(run);
            tokio::select! {
                _ = &mut run => {}
                _ = subsys.on_shutdown_requested() => {
                    capture.shutdown();
                    run.await;
                }
            }
            Ok::<(), SyncError>(())
        }));

        let fleet = self.fleet.clone();
        subsystem.start(SubsystemBuilder::new("Recorders", |subsys| async move {
            if let Err(e) = fleet.reconcile(&devices).await {
                log::warn!("not every recorder is reachable yet: {}", e);
            }
            subsys.on_shutdown_requested().await;
            fleet.disconnect_all().await
        }));

        let orchestrator = self.orchestrator.clone();
        subsystem.start(SubsystemBuilder::new("FollowCapture", |subsys| async move {
            orchestrator
                .follow_capture(subsys.create_cancellation_token())
                .await;
            Ok::<(), SyncError>(())
        }));

        let bridge = MessageBridge::new(
            self.orchestrator.clone(),
            self.transport.clone(),
            self.events.clone(),
        );
        let requests = bridge.install();
        subsystem.start(SubsystemBuilder::new("MessageBridge", |subsys| async move {
            bridge
                .run(requests, subsys.create_cancellation_token())
                .await;
            Ok::<(), SyncError>(())
        }));

        spawn_console(self.transport.clone());
    }
}

/// Read `<address> [args...]` lines from stdin and deliver them as inbound
/// messages. Runs on its own thread so a pending read never holds up shutdown.
fn spawn_console(transport: Arc<MemoryTransport>) {
    let spawned = std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                let mut tokens = line.split_whitespace();
                let Some(address) = tokens.next() else {
                    continue;
                };
                let args: Vec<MessageValue> = tokens.map(MessageValue::parse).collect();
                if !transport.deliver(address, &args) {
                    log::warn!("known addresses: {}", transport.addresses().join(", "));
                }
            }
            log::debug!("console closed");
        });
    if let Err(e) = spawned {
        log::warn!("cannot start console: {}", e);
    }
}

type Collaborators = (
    Arc<dyn CaptureConnector>,
    Arc<dyn ProcessProbe>,
    Vec<DeviceEndpoint>,
);

/// Emulated controller plus one emulated recorder per configured device.
#[cfg(feature = "emulator")]
async fn emulated(
    subsystem: &SubsystemHandle,
    config: &AppConfig,
) -> Result<Collaborators, SyncError> {
    use emulator::{EmulatedCapture, RecorderEmulator};

    let capture = EmulatedCapture::new();
    let mut recorders = Vec::new();
    let mut devices = Vec::new();
    for device in config.active_devices() {
        let emu = RecorderEmulator::start(&format!("Emulated Deck {}", device.id)).await?;
        log::info!("recorder {} emulated on {}", device.id, emu.addr());
        devices.push(emu.endpoint(device.id));
        recorders.push(emu);
    }

    // The emulators live until shutdown
    subsystem.start(SubsystemBuilder::new("Emulators", |subsys| async move {
        subsys.on_shutdown_requested().await;
        drop(recorders);
        Ok::<(), SyncError>(())
    }));

    let connector: Arc<dyn CaptureConnector> = Arc::new(capture.clone());
    let probe: Arc<dyn ProcessProbe> = Arc::new(capture);
    Ok((connector, probe, devices))
}

#[cfg(not(feature = "emulator"))]
async fn emulated(
    _subsystem: &SubsystemHandle,
    _config: &AppConfig,
) -> Result<Collaborators, SyncError> {
    Err(SyncError::Config(
        "--emulate needs the `emulator` feature".to_string(),
    ))
}

/// What an operator can still do without a capture API client.
fn detached_warning(host: &str) -> String {
    format!(
        "no control API client for the capture controller on {}: its process is watched, \
         but {} and the capture commands fail; use {} to record on the recorders alone",
        host,
        bridge::address::START_ALL,
        bridge::address::START_RECORDERS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli() {
        let args = Cli::parse_from(["takesync-server", "--emulate", "-c", "/tmp/s.json", "-vv"]);
        assert!(args.emulate);
        assert!(!args.write_config);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(args.verbose.log_level_filter(), log::LevelFilter::Trace);

        let args = Cli::parse_from(["takesync-server"]);
        assert!(!args.emulate);
        assert_eq!(args.verbose.log_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_detached_warning_names_the_working_address() {
        let text = detached_warning("localhost");
        assert!(text.contains("/RecordStartAll"));
        assert!(text.contains("fail"));
        assert!(text.contains("/RecordStartHyperDeck"));
    }
}

//! Application settings.
//!
//! Stored as JSON at `<config dir>/takesync/settings.json` unless `--config`
//! names another file. A missing file means defaults; a file that does not
//! parse is an error rather than being silently replaced.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use takesync_core::{DeviceEndpoint, ReconnectPolicy};

use crate::capture::LinkSettings;
use crate::error::SyncError;
use crate::orchestrator::OrchestratorSettings;
use crate::recorder::EngineSettings;

const SETTINGS_FILE: &str = "settings.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "takesync", "takesync")
}

/// Default location of the settings file, if the platform has one.
pub fn default_path() -> Option<PathBuf> {
    get_project_dirs().map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BridgeSettings {
    /// Address the message transport listens on
    pub listen: String,
    /// Address outbound messages are sent to
    pub broadcast: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeSettings {
            listen: "0.0.0.0:5555".to_string(),
            broadcast: "255.255.255.255:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RecorderSettings {
    pub enabled: bool,
    /// Start and stop the recorders when the capture source does
    pub sync_with_capture: bool,
    pub devices: Vec<DeviceEndpoint>,
    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        let engine = EngineSettings::default();
        RecorderSettings {
            enabled: true,
            sync_with_capture: true,
            devices: vec![
                DeviceEndpoint::new(1, "10.0.0.51", takesync_core::protocol::DEFAULT_PORT),
                DeviceEndpoint::new(2, "10.0.0.52", takesync_core::protocol::DEFAULT_PORT),
                DeviceEndpoint::new(3, "10.0.0.53", takesync_core::protocol::DEFAULT_PORT),
            ],
            command_timeout_ms: engine.command_timeout.as_millis() as u64,
            poll_interval_ms: engine.poll_interval.as_millis() as u64,
            reconnect_delay_ms: engine.reconnect_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CaptureSettings {
    /// Process names that identify the capture controller
    pub process_names: Vec<String>,
    pub host: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            process_names: vec!["ShogunLive".to_string(), "Shogun Live".to_string()],
            host: "localhost".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeSettings,
    pub recorders: RecorderSettings,
    pub capture: CaptureSettings,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl AppConfig {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path() {
                Some(p) => p,
                None => {
                    log::warn!("no configuration directory on this platform, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("{} not found, using defaults", path.display());
                return Ok(AppConfig {
                    path: Some(path),
                    ..Self::default()
                });
            }
            Err(e) => {
                return Err(SyncError::Config(format!("{}: {}", path.display(), e)));
            }
        };

        let mut config: AppConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config
            .capture
            .reconnect
            .validate()
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!("loaded settings from {}", path.display());
        config.path = Some(path);
        Ok(config)
    }

    /// Where [`save`](Self::save) writes.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn save(&self) -> Result<PathBuf, SyncError> {
        let path = self
            .path
            .clone()
            .or_else(default_path)
            .ok_or_else(|| SyncError::Config("no location to save settings".to_string()))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| SyncError::Config(format!("{}: {}", dir.display(), e)))?;
        }
        let file = fs::File::create(&path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!("saved settings to {}", path.display());
        Ok(path)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let r = &self.recorders;
        EngineSettings {
            command_timeout: Duration::from_millis(r.command_timeout_ms),
            poll_interval: Duration::from_millis(r.poll_interval_ms),
            reconnect_delay: Duration::from_millis(r.reconnect_delay_ms),
            ..EngineSettings::default()
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            reconnect: self.capture.reconnect,
            ..LinkSettings::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            recorders_enabled: self.recorders.enabled,
            sync_with_capture: self.recorders.sync_with_capture,
        }
    }

    /// Enabled recorder endpoints, or none when recorders are switched off.
    pub fn active_devices(&self) -> Vec<DeviceEndpoint> {
        if !self.recorders.enabled {
            return Vec::new();
        }
        self.recorders
            .devices
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect()
    }
}

//! # Bridge configuration
//!
//! YAML configuration for the bridge: global sections (media server,
//! discovery, polling) plus per-renderer settings. Per-renderer settings are
//! a `defaults` block and optional overrides keyed by renderer UDN:
//!
//! ```yaml
//! media_server:
//!   host: 192.168.1.10
//!   port: 9000
//! defaults:
//!   volume_mode: on_play
//!   accept_next_uri: false
//! devices:
//!   "uuid:5f9ec1b3-ed59-1900-4530-00a0defb9fe1":
//!     name: Kitchen
//!     enabled: false
//! ```
//!
//! The configuration file is searched in this order:
//! 1. the path given to [`BridgeConfig::load`]
//! 2. the `PMOBRIDGE_CONFIG` environment variable
//! 3. `.pmobridge/config.yaml` in the current directory
//! 4. `.pmobridge/config.yaml` in the user's home directory
//!
//! When none exists the built-in defaults are used.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::volume_curve::DEFAULT_VOLUME_CURVE;

const ENV_CONFIG_FILE: &str = "PMOBRIDGE_CONFIG";
const CONFIG_DIR: &str = ".pmobridge";
const CONFIG_FILE: &str = "config.yaml";

/// Shortest allowed rediscovery period.
pub const MIN_SCAN_INTERVAL_SECS: u64 = 30;
const MIN_SCAN_TIMEOUT_SECS: u64 = 5;

/// How host volume commands reach the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    /// Volume commands are dropped.
    Ignore,
    /// Volume is sent as soon as the host sets it.
    Immediate,
    /// Volume is remembered and only sent once playback starts.
    #[default]
    OnPlay,
}

/// Who produces the audio the renderer pulls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// The host stream is forwarded untouched.
    #[default]
    Stream,
    /// The bridge decodes and re-encodes the stream.
    Decode,
    /// The host talks to the renderer itself and owns its volume.
    Delegated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaServerConfig {
    pub host: String,
    pub port: u16,
    pub virtual_dir: String,
}

impl Default for MediaServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            virtual_dir: "pmobridge".to_string(),
        }
    }
}

impl MediaServerConfig {
    /// URL under which the bridge's own media server publishes `resource`.
    pub fn resource_url(&self, resource: &str) -> String {
        format!(
            "http://{}:{}/{}/{}",
            self.host,
            self.port,
            self.virtual_dir.trim_matches('/'),
            resource.trim_start_matches('/')
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds between searches; 0 searches only once, at startup.
    pub scan_interval_secs: u64,
    pub scan_timeout_secs: u64,
    /// Renderers from this manufacturer are our own and never controlled.
    pub self_manufacturer: String,
    pub max_renderers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            scan_timeout_secs: 15,
            self_manufacturer: "Logitech".to_string(),
            max_renderers: 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub tick_ms: u64,
    pub state_poll_ms: u64,
    pub track_poll_ms: u64,
    /// Consecutive action errors after which a renderer stops being polled.
    pub max_action_errors: u32,
    pub subscription_renew_secs: u64,
    pub use_events: bool,
    pub event_workers: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            state_poll_ms: 500,
            track_poll_ms: 1000,
            max_action_errors: 5,
            subscription_renew_secs: 60,
            use_events: false,
            event_workers: 2,
        }
    }
}

/// Effective settings of one renderer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enabled: bool,
    /// Display name override; the friendly name is used when empty.
    pub name: String,
    /// Renderer handles SetNextAVTransportURI natively.
    pub accept_next_uri: bool,
    pub send_metadata: bool,
    pub volume_mode: VolumeMode,
    /// Re-send the volume each time playback starts.
    pub force_volume: bool,
    /// Seek back to the pause position on resume.
    pub seek_after_pause: bool,
    pub volume_curve: String,
    /// Discovery cycles a renderer may be missing before it is removed.
    pub remove_count: u32,
    pub process_mode: ProcessMode,
    /// Reported stream length when metadata is not sent.
    pub stream_length: Option<u64>,
    /// Consecutive desired/observed mismatches before a host reset.
    pub stall_threshold: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: String::new(),
            accept_next_uri: false,
            send_metadata: true,
            volume_mode: VolumeMode::OnPlay,
            force_volume: false,
            seek_after_pause: false,
            volume_curve: DEFAULT_VOLUME_CURVE.to_string(),
            remove_count: 3,
            process_mode: ProcessMode::Stream,
            stream_length: None,
            stall_threshold: 20,
        }
    }
}

/// Per-renderer overrides; unset fields fall back to `defaults`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_next_uri: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_metadata: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_volume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_after_pause: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_curve: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_mode: Option<ProcessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_threshold: Option<u32>,
}

impl DeviceOverrides {
    fn apply(&self, base: &DeviceConfig) -> DeviceConfig {
        let mut merged = base.clone();
        if let Some(v) = self.enabled {
            merged.enabled = v;
        }
        if let Some(v) = &self.name {
            merged.name = v.clone();
        }
        if let Some(v) = self.accept_next_uri {
            merged.accept_next_uri = v;
        }
        if let Some(v) = self.send_metadata {
            merged.send_metadata = v;
        }
        if let Some(v) = self.volume_mode {
            merged.volume_mode = v;
        }
        if let Some(v) = self.force_volume {
            merged.force_volume = v;
        }
        if let Some(v) = self.seek_after_pause {
            merged.seek_after_pause = v;
        }
        if let Some(v) = &self.volume_curve {
            merged.volume_curve = v.clone();
        }
        if let Some(v) = self.remove_count {
            merged.remove_count = v;
        }
        if let Some(v) = self.process_mode {
            merged.process_mode = v;
        }
        if self.stream_length.is_some() {
            merged.stream_length = self.stream_length;
        }
        if let Some(v) = self.stall_threshold {
            merged.stall_threshold = v;
        }
        merged
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub media_server: MediaServerConfig,
    pub discovery: DiscoveryConfig,
    pub polling: PollingConfig,
    pub defaults: DeviceConfig,
    pub devices: BTreeMap<String, DeviceOverrides>,
}

impl BridgeConfig {
    /// Loads and sanitizes the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: BridgeConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.sanitize();
        info!(config_file = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Loads the first configuration file found, or the defaults.
    pub fn load_default() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::load(path),
            None => {
                info!("Config file not found, using default configuration");
                Ok(Self::default())
            }
        }
    }

    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
            info!(env_var = ENV_CONFIG_FILE, path = %env_path, "Trying to load config from env");
            return Some(PathBuf::from(env_path));
        }

        let local = Path::new(CONFIG_DIR).join(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }

        let home = home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
        home.exists().then_some(home)
    }

    /// Writes the configuration as YAML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Effective settings for the renderer `udn`.
    pub fn device(&self, udn: &str) -> DeviceConfig {
        match self.devices.get(udn) {
            Some(overrides) => overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// Records a newly seen renderer so that a saved configuration lists it.
    pub fn remember_device(&mut self, udn: &str, name: &str) {
        self.devices
            .entry(udn.to_string())
            .or_insert_with(|| DeviceOverrides {
                name: Some(name.to_string()),
                ..DeviceOverrides::default()
            });
    }

    /// True if at least one renderer can be controlled: either the defaults
    /// enable unknown renderers or an override enables a known one.
    pub fn any_enabled(&self) -> bool {
        self.defaults.enabled
            || self
                .devices
                .values()
                .any(|o| o.enabled.unwrap_or(self.defaults.enabled))
    }

    fn sanitize(&mut self) {
        let discovery = &mut self.discovery;
        // An interval of 0 searches once at startup and never again.
        if discovery.scan_interval_secs == 0 {
            discovery.scan_timeout_secs = discovery.scan_timeout_secs.max(MIN_SCAN_TIMEOUT_SECS);
        } else {
            if discovery.scan_interval_secs < MIN_SCAN_INTERVAL_SECS {
                warn!(
                    scan_interval = discovery.scan_interval_secs,
                    "Scan interval too short, using {}s", MIN_SCAN_INTERVAL_SECS
                );
                discovery.scan_interval_secs = MIN_SCAN_INTERVAL_SECS;
            }
            let max_timeout = discovery.scan_interval_secs - MIN_SCAN_TIMEOUT_SECS;
            discovery.scan_timeout_secs = discovery
                .scan_timeout_secs
                .clamp(MIN_SCAN_TIMEOUT_SECS, max_timeout);
        }
        if discovery.max_renderers == 0 {
            discovery.max_renderers = DiscoveryConfig::default().max_renderers;
        }

        let polling = &mut self.polling;
        polling.tick_ms = polling.tick_ms.max(50);
        polling.event_workers = polling.event_workers.max(1);
        polling.max_action_errors = polling.max_action_errors.max(1);
    }
}

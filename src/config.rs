use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Root configuration loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub camera: CameraConfig,
    #[serde(default)]
    pub warn: WarnConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub obs: ObsConfig,
    /// Remediation profiles, keyed by name (`[kill.default]`, ...).
    #[serde(default)]
    pub kill: HashMap<String, RemediationProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `ws://host:port` of the coordination server.
    pub url: String,
    /// Name announced in heartbeats.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence on the link longer than this raises a disconnect event.
    #[serde(default = "default_liveness_secs")]
    pub liveness_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Capture URI: `http(s)://` still-image endpoint or `file://` path.
    pub url: String,
    #[serde(default = "default_refresh_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub failure_backoff_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Seconds between connect attempts while the camera is down.
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    /// JPEG quality, 0-100.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarnConfig {
    /// Lifetime of overlay/audio units, seconds.
    #[serde(default = "default_warn_secs")]
    pub duration_secs: u64,
    /// Minimum spacing between non-priority alerts. Defaults to the duration.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    /// Overlay helper program and leading arguments.
    #[serde(default = "default_overlay_command")]
    pub overlay_command: Vec<String>,
    /// Audio helper program and leading arguments.
    #[serde(default = "default_audio_command")]
    pub audio_command: Vec<String>,
    /// Interval at which fresh frames are relayed to a motion overlay.
    #[serde(default = "default_image_interval_ms")]
    pub image_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_warn_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObsConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
}

/// Named bundle of remediation actions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemediationProfile {
    /// Process names to force-kill.
    #[serde(default)]
    pub taskkill: Vec<String>,
    /// Argument vectors to launch detached.
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
    #[serde(default)]
    pub obs: Option<RecordingAction>,
}

/// A configured command. Entries that are not a list of strings are kept so
/// they can be rejected one by one at execution time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Argv(Vec<String>),
    Malformed(toml::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingAction {
    Stop,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_api_port(),
        }
    }
}

impl Default for WarnConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_warn_secs(),
            cooldown_secs: None,
            overlay_command: default_overlay_command(),
            audio_command: default_audio_command(),
            image_interval_ms: default_image_interval_ms(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_warn_secs(),
            sweep_interval_ms: default_sweep_ms(),
        }
    }
}

impl WarnConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs.unwrap_or(self.duration_secs))
    }
}

impl ObsConfig {
    /// The recorder integration is on only when both host and port are set.
    pub fn enabled(&self) -> bool {
        self.host.is_some() && self.port.is_some()
    }
}

fn default_client_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "watchpost".into())
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    8787
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_heartbeat_ms() -> u64 {
    1000
}

fn default_liveness_secs() -> u64 {
    5
}

fn default_refresh_ms() -> u64 {
    100
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_failures() -> u32 {
    50
}

fn default_quality() -> u8 {
    90
}

fn default_max_dimension() -> u32 {
    1280
}

fn default_warn_secs() -> u64 {
    10
}

fn default_sweep_ms() -> u64 {
    1000
}

fn default_image_interval_ms() -> u64 {
    500
}

fn default_overlay_command() -> Vec<String> {
    vec!["watchpost-overlay".into()]
}

fn default_audio_command() -> Vec<String> {
    vec!["watchpost-audio".into()]
}

impl AppConfig {
    /// Load and parse the config file. Falls back to `./config.toml` next to
    /// the executable if no explicit path is given.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                // Look next to the executable first, then CWD
                let exe_dir = std::env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(Path::to_path_buf));

                match exe_dir.map(|dir| dir.join("config.toml")) {
                    Some(candidate) if candidate.exists() => candidate,
                    _ => std::path::PathBuf::from("config.toml"),
                }
            }
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config at {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        Ok(config)
    }
}

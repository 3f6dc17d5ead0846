use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tracing output of the card stack. Console output goes to stderr so it
/// never mixes with console command results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    /// Relative paths live under the local data directory.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    /// One of `minutely`, `hourly`, `daily`, `never`.
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: true,
            console_logging_enabled: true,
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: true,
            show_thread_ids: false,
            show_target: true,
            ansi_colors: true,
            rotation: default_rotation(),
        }
    }
}

/// Whether the serial link is rebuilt for every logical operation or kept
/// open between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    #[default]
    ReconnectPerCall,
    KeepAlive,
}

/// What to do when the card rejects a pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    /// Move on to the next candidate.
    SkipFailed,
    /// Repeat the whole pairing pass, up to `pairing_max_retries` times.
    #[default]
    Retry,
}

/// Where downloaded data is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataSinkKind {
    #[default]
    TempFile,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Card identity
    #[serde(default = "default_pin")]
    pub card_pin: String,
    #[serde(default)]
    pub card_name: Option<String>,
    #[serde(default = "default_device_class")]
    pub device_class: String,
    #[serde(default)]
    pub adapter_address: Option<String>,
    #[serde(default = "default_inquiry_timeout_secs")]
    pub inquiry_timeout_secs: u64,

    // Card filesystem
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_firmware_path")]
    pub firmware_path: String,
    #[serde(default = "default_firmware_settle_secs")]
    pub firmware_settle_secs: u64,

    // Serial link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_upload_delay_ms")]
    pub upload_delay_ms: u64,
    #[serde(default = "default_false")]
    pub strict_checksum: bool,

    // Session behaviour
    #[serde(default)]
    pub connection_policy: ConnectionPolicy,
    #[serde(default)]
    pub pairing_mode: PairingMode,
    #[serde(default = "default_pairing_max_retries")]
    pub pairing_max_retries: u32,
    #[serde(default)]
    pub data_sink: DataSinkKind,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // Logging
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            card_pin: default_pin(),
            card_name: None,
            device_class: default_device_class(),
            adapter_address: None,
            inquiry_timeout_secs: default_inquiry_timeout_secs(),
            base_path: default_base_path(),
            firmware_path: default_firmware_path(),
            firmware_settle_secs: default_firmware_settle_secs(),
            baud_rate: default_baud_rate(),
            serial_port: None,
            read_timeout_secs: default_read_timeout_secs(),
            upload_delay_ms: default_upload_delay_ms(),
            strict_checksum: false,
            connection_policy: ConnectionPolicy::default(),
            pairing_mode: PairingMode::default(),
            pairing_max_retries: default_pairing_max_retries(),
            data_sink: DataSinkKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    pub fn inquiry_timeout(&self) -> Duration {
        Duration::from_secs(self.inquiry_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn upload_delay(&self) -> Duration {
        Duration::from_millis(self.upload_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gatekeeper_card".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_pin() -> String {
    "0000".to_string()
}
fn default_device_class() -> String {
    "1F00".to_string()
}
fn default_inquiry_timeout_secs() -> u64 {
    7
}
fn default_base_path() -> String {
    "/apps/vault/data".to_string()
}
fn default_firmware_path() -> String {
    "/device/firmware".to_string()
}
fn default_firmware_settle_secs() -> u64 {
    25
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_read_timeout_secs() -> u64 {
    30
}
fn default_upload_delay_ms() -> u64 {
    1
}
fn default_pairing_max_retries() -> u32 {
    1
}
fn default_poll_interval_ms() -> u64 {
    100
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GateKeeperCard");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

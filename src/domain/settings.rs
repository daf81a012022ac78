use crate::domain::connection::CoreConfig;
use crate::domain::models::TargetSelector;
use crate::domain::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const APP_DIR: &str = "LSLedController";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
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
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
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
    "lsled_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Target
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub ble_characteristic_uuid: String,

    // Transmitter
    #[serde(default = "default_frame_cooldown_ms")]
    pub frame_cooldown_ms: u64,

    // Console
    #[serde(default = "default_brightness")]
    pub default_brightness: u8,
    #[serde(default = "default_true")]
    pub auto_scan_on_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_characteristic_uuid: default_characteristic_uuid(),
            frame_cooldown_ms: default_frame_cooldown_ms(),
            default_brightness: default_brightness(),
            auto_scan_on_start: default_true(),
        }
    }
}

impl Settings {
    pub fn target(&self) -> crate::error::Result<TargetSelector> {
        TargetSelector::parse(&self.ble_service_uuid, &self.ble_characteristic_uuid)
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig::new().with_cooldown(Duration::from_millis(self.frame_cooldown_ms))
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    protocol::CHARACTERISTIC_UUID.to_string()
}
fn default_frame_cooldown_ms() -> u64 {
    protocol::FRAME_COOLDOWN_MS
}
fn default_brightness() -> u8 {
    protocol::DEFAULT_BRIGHTNESS
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::config_dir()?.join("settings.json");
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults. A missing file
    /// is created with the defaults so there is something to edit.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let missing = !settings_path.exists();
        let service = Self {
            settings: Self::load_from_file(&settings_path).unwrap_or_default(),
            settings_path,
        };
        if missing {
            if let Err(e) = service.save() {
                warn!("Could not write default settings: {}", e);
            }
        }
        service
    }

    /// Per-user directory holding settings and the identity store.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
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

}

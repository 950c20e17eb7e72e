use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
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
    "nodelink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// What happens to a characteristic's notifications when its last
/// subscriber leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationRelease {
    /// Disable once the subscriber count drops to zero.
    #[default]
    OnLastSubscriber,
    /// Leave notifications on for the rest of the connection.
    KeepEnabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_payload")]
    pub max_payload_size: usize,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_mtu_timeout_ms")]
    pub mtu_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_notification_timeout_ms")]
    pub notification_timeout_ms: u64,
    #[serde(default = "default_retry_budget_ms")]
    pub retry_budget_ms: u64,
    #[serde(default)]
    pub notification_release: NotificationRelease,
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            mtu_timeout_ms: default_mtu_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            notification_timeout_ms: default_notification_timeout_ms(),
            retry_budget_ms: default_retry_budget_ms(),
            notification_release: NotificationRelease::default(),
            log_channel_capacity: default_log_channel_capacity(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

fn default_max_payload() -> usize {
    248
}
fn default_discovery_timeout_ms() -> u64 {
    15_000
}
fn default_mtu_timeout_ms() -> u64 {
    2_000
}
fn default_read_timeout_ms() -> u64 {
    2_000
}
fn default_write_timeout_ms() -> u64 {
    1_000
}
fn default_notification_timeout_ms() -> u64 {
    1_000
}
fn default_retry_budget_ms() -> u64 {
    5_000
}
fn default_log_channel_capacity() -> usize {
    256
}
fn default_notification_buffer() -> usize {
    64
}

/// Runtime form of [`SessionSettings`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_payload_size: usize,
    pub discovery_timeout: Duration,
    pub mtu_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub notification_timeout: Duration,
    pub retry_budget: Duration,
    pub notification_release: NotificationRelease,
    pub log_channel_capacity: usize,
    pub notification_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionSettings::default().into()
    }
}

impl From<SessionSettings> for SessionConfig {
    fn from(settings: SessionSettings) -> Self {
        Self {
            max_payload_size: settings.max_payload_size,
            discovery_timeout: Duration::from_millis(settings.discovery_timeout_ms),
            mtu_timeout: Duration::from_millis(settings.mtu_timeout_ms),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            notification_timeout: Duration::from_millis(settings.notification_timeout_ms),
            retry_budget: Duration::from_millis(settings.retry_budget_ms),
            notification_release: settings.notification_release,
            log_channel_capacity: settings.log_channel_capacity.max(1),
            notification_buffer: settings.notification_buffer.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub known_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
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

    /// Loads from an explicit file, falling back to defaults when it is
    /// missing or malformed.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("NodeLink");
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
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
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

    pub fn session_config(&self) -> SessionConfig {
        self.settings.session.clone().into()
    }

    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
            self.save()?;
        }
        Ok(())
    }

    pub fn set_last_connected(&mut self, address: &str) -> anyhow::Result<()> {
        self.settings.last_connected_address = Some(address.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "session": { "max_payload_size": 100, "notification_release": "keep_enabled" } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.session.max_payload_size, 100);
        assert_eq!(
            settings.session.notification_release,
            NotificationRelease::KeepEnabled
        );
        assert_eq!(settings.session.discovery_timeout_ms, 15_000);
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.known_addresses.is_empty());
    }

    #[test]
    fn test_session_config_conversion() {
        let config: SessionConfig = SessionSettings::default().into();
        assert_eq!(config.max_payload_size, 248);
        assert_eq!(config.mtu_timeout, Duration::from_secs(2));
        assert_eq!(config.retry_budget, Duration::from_secs(5));
        assert_eq!(
            config.notification_release,
            NotificationRelease::OnLastSubscriber
        );
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = std::env::temp_dir().join(format!("nodelink-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let mut service = SettingsService::with_path(path.clone());
        assert_eq!(service.get().session.max_payload_size, 248);

        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();
        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().known_addresses, vec!["AA:BB:CC:DD:EE:FF"]);

        fs::remove_dir_all(&dir).ok();
    }
}

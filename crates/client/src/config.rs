//! Client configuration management

use anyhow::{Context, Result, anyhow};
use common::LogFormat;
use driver::{DeviceFilter, PTP_INTERFACE_CLASS, PTP_INTERFACE_SUBCLASS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Full,
        }
    }
}

/// Which USB devices the transport pairs with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub interface_class: u8,
    pub interface_subclass: u8,
    /// Allow patterns; empty allows every camera
    ///
    /// Pattern formats:
    /// - "vid:pid" (e.g., "04a9:32b4") - exact vendor:product match
    /// - "vid:*" (e.g., "04a9:*") - all devices from vendor
    /// - Any other string - case-insensitive product name substring match
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            interface_class: PTP_INTERFACE_CLASS,
            interface_subclass: PTP_INTERFACE_SUBCLASS,
            allowed: Vec::new(),
        }
    }
}

impl DeviceSettings {
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter {
            interface_class: self.interface_class,
            interface_subclass: self.interface_subclass,
            allowed: self.allowed.clone(),
        }
    }
}

/// Session tuning, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub config_max_retries: u32,
    pub config_poll_interval_ms: u64,
    pub preview_frame_interval_ms: u64,
    pub auto_recover: bool,
    pub recovery_delay_ms: u64,
    pub announce_connected: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionOptions::default().into()
    }
}

impl From<SessionOptions> for SessionSettings {
    fn from(options: SessionOptions) -> Self {
        Self {
            config_max_retries: options.config_max_retries,
            config_poll_interval_ms: options.config_poll_interval.as_millis() as u64,
            preview_frame_interval_ms: options.preview_frame_interval.as_millis() as u64,
            auto_recover: options.auto_recover,
            recovery_delay_ms: options.recovery_delay.as_millis() as u64,
            announce_connected: options.announce_connected,
        }
    }
}

impl SessionSettings {
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            config_max_retries: self.config_max_retries,
            config_poll_interval: Duration::from_millis(self.config_poll_interval_ms),
            preview_frame_interval: Duration::from_millis(self.preview_frame_interval_ms),
            auto_recover: self.auto_recover,
            recovery_delay: Duration::from_millis(self.recovery_delay_ms),
            announce_connected: self.announce_connected,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/ptp-camera/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Config: {} device patterns, auto_recover={}",
            config.device.allowed.len(),
            config.session.auto_recover
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ptp-camera").join("client.toml")
        } else {
            PathBuf::from(".config/ptp-camera/client.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.session.config_max_retries == 0 {
            return Err(anyhow!("session.config_max_retries must be at least 1"));
        }
        if self.session.config_poll_interval_ms == 0 {
            return Err(anyhow!("session.config_poll_interval_ms must be positive"));
        }

        if self.device.allowed.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow!("Empty pattern in device.allowed list"));
        }

        Ok(())
    }
}

/// Load a configuration file, expanding `~` in the path
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.client.log_level, "info");
        assert_eq!(config.client.log_format, LogFormat::Full);
        assert_eq!(config.device.interface_class, 6);
        assert_eq!(config.device.interface_subclass, 1);
        assert!(config.device.allowed.is_empty());
        assert_eq!(config.session.config_max_retries, 10);
        assert_eq!(config.session.config_poll_interval_ms, 100);
        assert_eq!(config.session.recovery_delay_ms, 5000);
        assert!(config.session.auto_recover);
        assert!(!config.session.announce_connected);
    }

    #[test]
    fn test_config_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ClientConfig = toml::from_str(
            r#"
            [client]
            log_level = "debug"
            log_format = "compact"

            [session]
            announce_connected = true
            "#,
        )
        .unwrap();

        assert_eq!(parsed.client.log_format, LogFormat::Compact);
        assert!(parsed.session.announce_connected);
        assert_eq!(parsed.session.config_max_retries, 10);
        assert_eq!(parsed.device, DeviceSettings::default());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.client.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.client.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_session_budget() {
        let mut config = ClientConfig::default();
        config.session.config_max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.session.config_poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_pattern() {
        let mut config = ClientConfig::default();
        config.device.allowed.push("  ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_options_conversion() {
        let settings = SessionSettings {
            config_max_retries: 3,
            config_poll_interval_ms: 20,
            preview_frame_interval_ms: 33,
            auto_recover: false,
            recovery_delay_ms: 250,
            announce_connected: true,
        };

        let options = settings.options();
        assert_eq!(options.config_max_retries, 3);
        assert_eq!(options.config_poll_interval, Duration::from_millis(20));
        assert_eq!(options.preview_frame_interval, Duration::from_millis(33));
        assert_eq!(options.recovery_delay, Duration::from_millis(250));
        assert!(!options.auto_recover);
        assert!(options.announce_connected);
        assert_eq!(SessionSettings::from(options), settings);
    }

    #[test]
    fn test_device_filter_conversion() {
        let settings = DeviceSettings {
            allowed: vec!["04a9:*".to_string()],
            ..DeviceSettings::default()
        };

        let filter = settings.filter();
        assert!(filter.matches_interface(6, 1));
        assert!(filter.allows(0x04a9, 0x32b4, None));
        assert!(!filter.allows(0x04b0, 0x0440, None));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.toml");

        let mut config = ClientConfig::default();
        config.client.log_level = "debug".to_string();
        config.device.allowed = vec!["EOS".to_string()];
        config.session.recovery_delay_ms = 1000;
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(Some(path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(&path, "[client]\nlog_level = \"loud\"\n").unwrap();

        assert!(ClientConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/ptp-camera/client.toml").is_err());
    }
}

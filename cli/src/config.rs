// Configuration management for the blelink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blelink/config.json
// - Linux: ~/.config/blelink/config.json
// - Windows: %APPDATA%\blelink\config.json

use anyhow::{Context, Result};
use blelink_core::LinkConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link layer settings shared by both roles
    pub link: LinkConfig,

    /// Message the peripheral indicates back after each command
    pub ack: Option<Value>,

    /// How long the central scans before connecting, in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            ack: Some(Value::String("ACK".to_string())),
            scan_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .link
                .validate()
                .context("Invalid link settings in config file")?;
            tracing::debug!("Loaded config from {}", config_file.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            tracing::info!("Created default config at {}", config_file.display());
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "device_name" => updated.link.device_name = value.to_string(),
            "service_uuid" => {
                updated.link.service_uuid = value.parse().context("Invalid UUID")?;
            }
            "mtu" => updated.link.mtu = value.parse().context("Invalid number")?,
            "queue_capacity" => {
                updated.link.queue_capacity = value.parse().context("Invalid number")?;
            }
            "reassembly_timeout_ms" => {
                updated.link.reassembly_timeout_ms = value.parse().context("Invalid number")?;
            }
            "registration_retries" => {
                updated.link.registration_retries = value.parse().context("Invalid number")?;
            }
            "ack" => {
                updated.ack = if value.is_empty() {
                    None
                } else {
                    Some(serde_json::from_str(value).context("ack must be JSON")?)
                };
            }
            "scan_timeout_ms" => {
                updated.scan_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated
            .link
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "device_name" => Some(self.link.device_name.clone()),
            "service_uuid" => Some(self.link.service_uuid.to_string()),
            "mtu" => Some(self.link.mtu.to_string()),
            "queue_capacity" => Some(self.link.queue_capacity.to_string()),
            "reassembly_timeout_ms" => Some(self.link.reassembly_timeout_ms.to_string()),
            "registration_retries" => Some(self.link.registration_retries.to_string()),
            "ack" => self.ack.as_ref().map(|v| v.to_string()),
            "scan_timeout_ms" => Some(self.scan_timeout_ms.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("device_name".to_string(), self.link.device_name.clone()),
            ("service_uuid".to_string(), self.link.service_uuid.to_string()),
            ("mtu".to_string(), self.link.mtu.to_string()),
            ("queue_capacity".to_string(), self.link.queue_capacity.to_string()),
            (
                "reassembly_timeout_ms".to_string(),
                format!("{}ms", self.link.reassembly_timeout_ms),
            ),
            (
                "registration_retries".to_string(),
                self.link.registration_retries.to_string(),
            ),
            (
                "ack".to_string(),
                self.ack
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
            ("scan_timeout_ms".to_string(), format!("{}ms", self.scan_timeout_ms)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.link.mtu, 20);
        assert_eq!(config.get("ack").as_deref(), Some("\"ACK\""));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.link, deserialized.link);
    }

    #[test]
    fn test_apply_validates() {
        let mut config = Config::default();
        config.apply("mtu", "185").unwrap();
        assert_eq!(config.get("mtu").as_deref(), Some("185"));

        assert!(config.apply("mtu", "1").is_err());
        assert_eq!(config.link.mtu, 185);

        config.apply("ack", "").unwrap();
        assert!(config.ack.is_none());
        assert!(config.apply("nope", "1").is_err());
    }
}

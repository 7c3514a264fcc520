//! Application configuration, stored as JSON in the platform config dir.

use std::path::Path;

use anyhow::anyhow;
use directories::ProjectDirs;
use log::info;
use serde::{Deserialize, Serialize};

use crate::ble::{ScanFilter, SessionOptions};
use crate::bridge::DEVICE_SELECTED_HANDLER;
use crate::error::Result;

pub const CONFIG_FILE: &str = "ble-event-bridge.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub device_selected_handler: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { device_selected_handler: DEVICE_SELECTED_HANDLER.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub session: SessionOptions,
    pub bridge: BridgeConfig,
    /// Filter used when the page requests a device.
    pub scan: ScanFilter,
    pub request_buffer_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            bridge: BridgeConfig::default(),
            scan: ScanFilter::default(),
            request_buffer_size: 32,
        }
    }
}

impl AppConfig {
    /// Loads `config_file` from the user config dir, writing the defaults
    /// there first if it does not exist.
    pub async fn load(config_file: &str) -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "ble-event-bridge", "ble-event-bridge")
            .ok_or_else(|| anyhow!("No home directory to store the config in"))?;
        Self::from_path(&proj_dirs.config_dir().join(config_file)).await
    }

    pub async fn from_path(config_file_path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(config_file_path).await? {
            let content = tokio::fs::read_to_string(config_file_path).await?;
            return Ok(serde_json::from_str(&content)?);
        }

        let config = Self::default();
        if let Some(config_dir) = config_file_path.parent() {
            tokio::fs::create_dir_all(config_dir).await?;
        }
        tokio::fs::write(config_file_path, serde_json::to_string_pretty(&config)?)
            .await?;
        info!("Default config written to {}", config_file_path.display());

        Ok(config)
    }
}

/// Scratch location for config files in tests.
#[cfg(test)]
pub(crate) fn temp_config_path() -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("ble-event-bridge-{}", uuid::Uuid::new_v4()))
        .join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::bt_uuid;

    #[tokio::test]
    async fn test_missing_config_is_created() {
        let path = temp_config_path();

        let config = AppConfig::from_path(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        //second load reads what was written
        let reloaded = AppConfig::from_path(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_partial_config_keeps_defaults() {
        let path = temp_config_path();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &path,
            r#"{
                "session": {"showPowerAlert": true},
                "scan": {"services": ["0000180f-0000-1000-8000-00805f9b34fb"]}
            }"#,
        )
        .await
        .unwrap();

        let config = AppConfig::from_path(&path).await.unwrap();
        assert!(config.session.show_power_alert);
        assert_eq!(config.scan.services, vec![bt_uuid::from_u16(0x180F)]);
        assert_eq!(config.bridge.device_selected_handler, "onDeviceSelected");
        assert_eq!(config.request_buffer_size, 32);
    }

    #[tokio::test]
    async fn test_malformed_config_is_an_error() {
        let path = temp_config_path();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "{ not json").await.unwrap();

        assert!(AppConfig::from_path(&path).await.is_err());
    }
}

// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{self, config::POLL_INTERVAL};
use crate::bluetooth::LinkConfig;

const APP_DIR: &str = "videostreamer";
const CONFIG_FILE: &str = "config.toml";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Frame upload server.
    pub stream: StreamConfig,

    /// BLE peripheral settings.
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,

    /// Kept as text; validated when connecting.
    pub port: String,

    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: "8080".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Peripheral to connect to at startup.
    pub device_address: Option<String>,

    pub service_uuid: Uuid,
    pub voltage_uuid: Uuid,
    pub switch_uuid: Uuid,

    pub poll_interval_ms: u64,

    /// Subscribe to voltage notifications.
    pub notifications: bool,

    /// Poll the voltage characteristic.
    pub polling: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            service_uuid: ble_constants::SERVICE_UUID,
            voltage_uuid: ble_constants::VOLTAGE_UUID,
            switch_uuid: ble_constants::SWITCH_UUID,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            notifications: true,
            polling: true,
        }
    }
}

impl BluetoothConfig {
    /// Settings for [`crate::bluetooth::BleLink::spawn`].
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            service: self.service_uuid,
            voltage_characteristic: self.voltage_uuid,
            notifications: self.notifications,
            polling: self.polling,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load `path`, writing a default file there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

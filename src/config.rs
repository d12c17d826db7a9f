/*
 * turbodl - Multi-connection HTTP download accelerator.
 * Copyright (C) 2025  turbodl contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Persistent defaults for the CLI, loaded from TOML.
//!
//! The engine itself never reads configuration; these values only seed the
//! command-line defaults.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// On-disk configuration for turbodl
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parallel connections: "auto" or 1..24
    pub max_connections: String,

    /// Advertised link speed in Mbps
    pub connection_speed_mbps: f64,

    /// RAM buffer mode: "auto", "on" or "off"
    pub ram_buffer: String,

    /// Pre-allocate disk space before downloading
    pub pre_allocate_space: bool,

    /// Replace existing files instead of numbering new ones
    pub overwrite: bool,

    /// Seconds without data before a connection is recycled
    pub inactivity_timeout_secs: u64,

    /// Log level when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: "auto".to_string(),
            connection_speed_mbps: 80.0,
            ram_buffer: "auto".to_string(),
            pre_allocate_space: false,
            overwrite: true,
            inactivity_timeout_secs: 120,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration, trying in order:
    /// 1. /etc/turbodl/turbodl.toml (system-wide)
    /// 2. ~/.config/turbodl/config.toml (user)
    ///
    /// The user file wins; unreadable or malformed files fall back to the
    /// defaults silently.
    pub fn load() -> Self {
        let mut config = Config::default();

        let system_config = Path::new("/etc/turbodl/turbodl.toml");
        if let Some(parsed) = Self::read_file(system_config) {
            config = parsed;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("turbodl").join("config.toml");
            if let Some(parsed) = Self::read_file(&user_config) {
                config = parsed;
            }
        }

        config
    }

    fn read_file(path: &Path) -> Option<Config> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Config>(&content) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config");
                None
            }
        }
    }
}

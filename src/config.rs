//! On-disk defaults for the beacon.

use std::fs;

use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub server_url: String,
    pub poll_interval: u64,
    pub jitter: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        BeaconConfig {
            server_url: "http://127.0.0.1:8080".to_string(),
            poll_interval: 5,
            jitter: 2,
        }
    }
}

impl BeaconConfig {
    /// Loads `config.json` from the working directory, falling back to
    /// compiled-in defaults when it is absent or unreadable.
    pub fn load() -> Self {
        match fs::read_to_string(CONFIG_FILE) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!("[CONFIG] Loaded {}", CONFIG_FILE);
                    config
                }
                Err(e) => {
                    warn!("[CONFIG] {} unreadable ({}); using defaults", CONFIG_FILE, e);
                    BeaconConfig::default()
                }
            },
            Err(_) => BeaconConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiled_defaults() {
        let config = BeaconConfig::default();
        assert_eq!(config.server_url, "http://127.0.0.1:8080");
        assert_eq!(config.poll_interval, 5);
        assert_eq!(config.jitter, 2);
    }

    #[test]
    fn test_partial_file_fills_from_defaults() {
        let config: BeaconConfig =
            serde_json::from_str(r#"{"server_url": "http://c2.local"}"#).unwrap();
        assert_eq!(config.server_url, "http://c2.local");
        assert_eq!(config.poll_interval, 5);
        assert_eq!(config.jitter, 2);
    }
}

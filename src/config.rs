use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the device portal, e.g. "http://192.168.4.1"
    pub device_url: String,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_url: "http://192.168.4.1".to_string(),
            poll_interval_ms: common::POLL_INTERVAL_MS,
            chunk_size: common::UPLOAD_CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Load the config from a RON file, falling back to defaults when no
    /// file exists. A present-but-broken file is an error rather than a
    /// silent fallback.
    pub fn load(path: Option<&Path>) -> Result<Config, Error> {
        let path = path.unwrap_or_else(|| Path::new("bridge-ota.ron"));
        if !path.exists() {
            return Ok(Config::default());
        }
        let config = std::fs::read_to_string(path)?;
        let config: Config = ron::from_str(&config)?;
        if config.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        Ok(config)
    }
}

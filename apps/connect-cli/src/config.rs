//! CLI configuration.
//!
//! Supports loading from a YAML file with environment variable overrides.
//! The OAuth/AP handshake that produces real Spotify credentials is out of
//! scope for the engine; this config only names where to
//! find a credentials blob the host already has, the device identity to
//! present, and the `spclient` host to talk to.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// CLI configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// UUID presented to Spotify as this device's identity.
    /// Override: `CONNECT_DEVICE_ID`
    pub device_id: String,

    /// Human-readable device name shown in the Connect device picker.
    /// Override: `CONNECT_DEVICE_NAME`
    pub device_name: String,

    /// Spotify device type (`computer`, `speaker`, `smartphone`, ...).
    pub device_type: String,

    /// Path to a credentials blob: either a bare access token (one line,
    /// prefixed `access_token:`) or an opaque reusable blob the host's
    /// out-of-band OAuth flow produced.
    /// Override: `CONNECT_CREDENTIALS_PATH`
    pub credentials_path: Option<PathBuf>,

    /// `spclient` host used for metadata, extended-metadata, and PutState
    /// requests.
    pub spclient_host: String,

    /// Whether the pipeline mirrors local playback back to the cluster via
    /// ConnectState PUTs.
    pub bidirectional_mode: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: "connect-cli".to_string(),
            device_type: "computer".to_string(),
            credentials_path: None,
            spclient_host: "spclient.wg.spotify.com".to_string(),
            bidirectional_mode: true,
        }
    }
}

impl CliConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CONNECT_DEVICE_ID") {
            self.device_id = val;
        }
        if let Ok(val) = std::env::var("CONNECT_DEVICE_NAME") {
            self.device_name = val;
        }
        if let Ok(val) = std::env::var("CONNECT_CREDENTIALS_PATH") {
            self.credentials_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("CONNECT_SPCLIENT_HOST") {
            self.spclient_host = val;
        }
    }

    /// Converts to connect-core's engine-wide tunable config.
    pub fn to_engine_config(&self) -> connect_core::EngineConfig {
        connect_core::EngineConfig {
            bidirectional_mode: self.bidirectional_mode,
            ..Default::default()
        }
    }
}

//! VPN Configuration
//!
//! Identities, paths and timing bounds for bringing the tunnel up.
//! Loaded from the `[vpn]` table of the settings file; every field has a
//! default so an empty table is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete VPN configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Package identifier of the external VPN client
    pub client_package: String,
    /// Identity we present to the VPN client when asking to prepare
    pub caller_identity: String,
    /// Control socket exposed by the VPN client
    pub control_socket: PathBuf,
    /// Upper bound for binding to the control interface
    pub bind_timeout_ms: u64,
    /// Upper bound for the tunnel to report CONNECTED
    pub connect_timeout_ms: u64,
    /// Extra wait after CONNECTED before reporting success
    pub settle_ms: u64,
    /// Cached tunnel config is re-fetched once older than this
    pub config_freshness_secs: u64,
    /// File name of the cached tunnel config inside the cache dir
    pub cache_file_name: String,
    /// Store URL prefix, the client package is appended
    pub store_url_prefix: String,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            client_package: "de.blinkt.openvpn".to_string(),
            caller_identity: "com.pbs.tv".to_string(),
            control_socket: default_control_socket(),
            bind_timeout_ms: 5_000,
            connect_timeout_ms: 30_000,
            settle_ms: 1_000,
            config_freshness_secs: 24 * 60 * 60,
            cache_file_name: "wg.txt".to_string(),
            store_url_prefix: "market://details?id=".to_string(),
        }
    }
}

fn default_control_socket() -> PathBuf {
    let runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    Path::new(&runtime).join("openvpn-api.sock")
}

impl VpnConfig {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn config_freshness(&self) -> Duration {
        Duration::from_secs(self.config_freshness_secs)
    }

    /// Store page for installing the VPN client
    pub fn store_url(&self) -> String {
        format!("{}{}", self.store_url_prefix, self.client_package)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_package.trim().is_empty() {
            return Err(ConfigError::EmptyField("client_package"));
        }
        if self.caller_identity.trim().is_empty() {
            return Err(ConfigError::EmptyField("caller_identity"));
        }
        if self.cache_file_name.trim().is_empty() {
            return Err(ConfigError::EmptyField("cache_file_name"));
        }
        if self.bind_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("bind_timeout_ms"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("connect_timeout_ms"));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse VPN config: {0}")]
    Parse(String),

    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("`{0}` must be greater than zero")]
    ZeroTimeout(&'static str),
}

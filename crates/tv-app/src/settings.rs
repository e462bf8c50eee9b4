//! Application Settings
//!
//! Loaded from a TOML file whose path is the first command line argument
//! or `TV_SETTINGS`. Without either, the defaults are used.
//!
//! ```toml
//! mode = "local-with-vpn"
//! data_dir = "/var/lib/pbs-tv"
//!
//! [vpn]
//! connect_timeout_ms = 45000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tv_vpn::VpnConfig;

/// Environment variable naming the settings file
pub const SETTINGS_ENV: &str = "TV_SETTINGS";

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Could not read settings file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Where content comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    /// Content server on the home network
    #[default]
    Remote,
    /// Embedded content server on loopback
    Local,
    /// Embedded content server, with its upstream reached through the tunnel
    LocalWithVpn,
}

impl BackendMode {
    pub fn uses_local_server(self) -> bool {
        !matches!(self, BackendMode::Remote)
    }

    pub fn uses_vpn(self) -> bool {
        matches!(self, BackendMode::LocalWithVpn)
    }
}

/// Complete application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mode: BackendMode,
    pub remote_server_url: String,
    pub local_server_url: String,
    /// Holds the tunnel config cache and the local server's cache
    pub data_dir: PathBuf,
    /// Program and arguments that run the local content server
    pub local_server_command: Vec<String>,
    pub local_server_settle_ms: u64,
    pub post_vpn_settle_ms: u64,
    pub vpn: VpnConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            remote_server_url: "http://192.168.1.2:3000".to_string(),
            local_server_url: "http://127.0.0.1:3000".to_string(),
            data_dir: default_data_dir(),
            local_server_command: vec!["pbs-tv-server".to_string()],
            local_server_settle_ms: 500,
            post_vpn_settle_ms: 500,
            vpn: VpnConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("pbs-tv");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/pbs-tv"),
        None => PathBuf::from("./pbs-tv-data"),
    }
}

impl Settings {
    /// Load from the path given on the command line, then `TV_SETTINGS`
    pub fn load(cli_path: Option<PathBuf>) -> Result<Self, SettingsError> {
        let path = cli_path.or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from));
        match path {
            Some(path) => Self::from_toml_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (name, url) in [
            ("remote_server_url", &self.remote_server_url),
            ("local_server_url", &self.local_server_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SettingsError::Invalid(format!(
                    "{} must be an http(s) URL, got {:?}",
                    name, url
                )));
            }
        }
        if self.mode.uses_local_server() && self.local_server_command.is_empty() {
            return Err(SettingsError::Invalid(
                "local_server_command is empty".to_string(),
            ));
        }
        self.vpn
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }

    /// Base URL of the content server for `mode`
    pub fn server_url(&self, mode: BackendMode) -> &str {
        match mode {
            BackendMode::Remote => &self.remote_server_url,
            BackendMode::Local | BackendMode::LocalWithVpn => &self.local_server_url,
        }
    }

    pub fn local_server_settle(&self) -> Duration {
        Duration::from_millis(self.local_server_settle_ms)
    }

    pub fn post_vpn_settle(&self) -> Duration {
        Duration::from_millis(self.post_vpn_settle_ms)
    }

    /// Cache directory of the local content server
    pub fn server_cache_dir(&self) -> PathBuf {
        self.data_dir.join("server")
    }
}

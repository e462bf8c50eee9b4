//! Secret Config Fetcher
//!
//! Produces the [`TunnelConfig`] handed to the external VPN client.
//!
//! 1. If `<cache_dir>/<cache_file_name>` exists and is no older than the
//!    freshness window, its contents are returned as-is (no network).
//! 2. Otherwise the bootstrap URL is de-obfuscated, the blob downloaded,
//!    base64-decoded and decrypted with [`ConfigCipher`].
//! 3. The plaintext replaces the cache file. The write goes through a
//!    temporary file and a rename, and only happens after a successful
//!    decrypt, so a bad blob never clobbers a good cache.

use crate::cipher::{ConfigCipher, DecryptError, EMBEDDED_CONFIG_URL, deobfuscate_url};
use crate::config::VpnConfig;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tv_network::HttpClient;

/// Opaque tunnel configuration text consumed by the VPN client
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig(String);

impl TunnelConfig {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Config text carries credentials; never print it.
impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelConfig({} bytes)", self.0.len())
    }
}

/// Config fetch errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Decrypt error: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("Invalid bootstrap URL: {0}")]
    InvalidUrl(DecryptError),

    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where encrypted blobs come from
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// GET `url` and return the body as text
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl BlobSource for HttpClient {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .get(url)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !response.is_success() {
            return Err(FetchError::Network(format!(
                "bootstrap host answered {}",
                response.status
            )));
        }

        response
            .text()
            .map_err(|_| FetchError::Network("response body is not UTF-8".to_string()))
    }
}

/// Fetches, decrypts and caches the tunnel configuration
pub struct SecretConfigFetcher {
    source: Arc<dyn BlobSource>,
    cipher: ConfigCipher,
    obfuscated_url: String,
    freshness: Duration,
    file_name: String,
}

impl SecretConfigFetcher {
    /// Create a fetcher with a 24h freshness window and `wg.txt` cache file
    pub fn new(source: Arc<dyn BlobSource>, cipher: ConfigCipher, obfuscated_url: &str) -> Self {
        Self {
            source,
            cipher,
            obfuscated_url: obfuscated_url.to_string(),
            freshness: Duration::from_secs(24 * 60 * 60),
            file_name: "wg.txt".to_string(),
        }
    }

    /// Fetcher using the embedded URL and key material
    pub fn from_config(source: Arc<dyn BlobSource>, config: &VpnConfig) -> Result<Self, FetchError> {
        let cipher = ConfigCipher::embedded()?;
        Ok(Self::new(source, cipher, EMBEDDED_CONFIG_URL)
            .with_freshness(config.config_freshness())
            .with_file_name(&config.cache_file_name))
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_file_name(mut self, file_name: &str) -> Self {
        self.file_name = file_name.to_string();
        self
    }

    /// Location of the cached plaintext
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.file_name)
    }

    /// Return a fresh tunnel config, downloading only when the cache is stale
    pub async fn fetch(&self, cache_dir: &Path) -> Result<TunnelConfig, FetchError> {
        let path = self.cache_path(cache_dir);

        if let Some(cached) = self.read_fresh(&path).await? {
            debug!("Config file already up to date, nothing to do");
            return Ok(cached);
        }

        let url = deobfuscate_url(&self.obfuscated_url).map_err(FetchError::InvalidUrl)?;
        info!("Downloading tunnel config from {}", url);

        let encrypted = self.source.fetch_text(&url).await?;
        let plaintext = self.cipher.decrypt(&encrypted).inspect_err(|e| {
            warn!("Tunnel config blob could not be decrypted: {}", e);
        })?;

        info!("Decrypted tunnel config ({} bytes)", plaintext.len());
        write_atomically(cache_dir, &path, &plaintext).await?;

        Ok(TunnelConfig::new(plaintext))
    }

    /// Read the cache if it exists and is within the freshness window
    async fn read_fresh(&self, path: &Path) -> Result<Option<TunnelConfig>, FetchError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A modification time in the future counts as brand new.
        let age = SystemTime::now()
            .duration_since(metadata.modified()?)
            .unwrap_or(Duration::ZERO);

        if age > self.freshness {
            debug!("Cached config is {:?} old, refreshing", age);
            return Ok(None);
        }

        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(TunnelConfig::new(text))),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Cached config is not valid text, refreshing: {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomically(dir: &Path, path: &Path, contents: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

//! Content backend bootstrap
//!
//! [`Backend::init`] runs once per process: it picks the content server for
//! the requested mode, brings the tunnel up when the mode needs it and
//! starts the local content server. Content requests go through
//! [`Backend::get`] afterwards.
//!
//! A VPN that fails to come up is logged and the backend carries on
//! without it. A local server that fails to start fails `init`, which can
//! then be retried.

use crate::prompt::ConsentPrompt;
use crate::settings::{BackendMode, Settings};
use anyhow::Context;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use tv_network::{HttpClient, HttpError, Response};
use tv_vpn::{ConnectionState, ConsentOutcome, VpnConnectionManager};

/// Backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend is not initialized")]
    NotInitialized,

    #[error("Local server failed to start: {0}")]
    LocalServer(#[source] io::Error),

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Starts the local content server
#[async_trait]
pub trait LocalServer: Send + Sync {
    /// Start serving, caching content under `cache_dir`
    async fn start(&self, cache_dir: &Path) -> io::Result<()>;
}

/// Runs the local content server as a child process.
///
/// The child is killed when this launcher is dropped.
pub struct ProcessServer {
    command: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl ProcessServer {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocalServer for ProcessServer {
    async fn start(&self, cache_dir: &Path) -> io::Result<()> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "local server command is empty")
        })?;

        let child = Command::new(program)
            .args(args)
            .arg("--cache-dir")
            .arg(cache_dir)
            .kill_on_drop(true)
            .spawn()?;

        info!("Started local server {} (pid {:?})", program, child.id());
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        Ok(())
    }
}

/// Collaborators the backend drives
pub struct BackendParts {
    pub local_server: Arc<dyn LocalServer>,
    /// Needed only for `local-with-vpn`
    pub vpn: Option<Arc<VpnConnectionManager>>,
    pub prompt: Arc<dyn ConsentPrompt>,
}

/// Content backend
pub struct Backend {
    settings: Settings,
    http: Arc<HttpClient>,
    local_server: Arc<dyn LocalServer>,
    vpn: Option<Arc<VpnConnectionManager>>,
    prompt: Arc<dyn ConsentPrompt>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    server_url: OnceLock<String>,
}

impl Backend {
    pub fn new(settings: Settings, http: Arc<HttpClient>, parts: BackendParts) -> Self {
        Self {
            settings,
            http,
            local_server: parts.local_server,
            vpn: parts.vpn,
            prompt: parts.prompt,
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            server_url: OnceLock::new(),
        }
    }

    /// Initialize once; later calls (with any mode) are no-ops
    pub async fn init(&self, mode: BackendMode) -> Result<(), BackendError> {
        if self.initialized.load(Ordering::Acquire) {
            debug!("Backend is already initialized, nothing to do");
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let server_url = self.settings.server_url(mode).to_string();
        info!("Initializing {:?} backend at {}", mode, server_url);

        if mode.uses_vpn() {
            match self.bring_up_vpn().await {
                Ok(state) if state.is_connected() => info!("VPN is up"),
                Ok(state) => warn!("VPN not connected ({}), continuing without it", state),
                Err(e) => warn!("VPN init failed, continuing without it: {:#}", e),
            }
        }

        if mode.uses_local_server() {
            self.start_local_server().await?;
        }

        // Only ever set here, under the init lock, before the flag flips.
        let _ = self.server_url.set(server_url);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Base URL chosen by `init`
    pub fn server_url(&self) -> Result<&str, BackendError> {
        if !self.is_initialized() {
            error!("Backend is not initialized, failing");
            return Err(BackendError::NotInitialized);
        }
        self.server_url
            .get()
            .map(String::as_str)
            .ok_or(BackendError::NotInitialized)
    }

    /// `GET` a path on the content server
    pub async fn get(&self, path: &str) -> Result<Response, BackendError> {
        let url = format!("{}{}", self.server_url()?, path);
        debug!("GET {}", url);
        Ok(self.http.get(&url).await?)
    }

    /// Last published tunnel state, if this backend manages a tunnel
    pub fn vpn_state(&self) -> Option<ConnectionState> {
        self.vpn.as_ref().map(|vpn| vpn.state())
    }

    async fn bring_up_vpn(&self) -> anyhow::Result<ConnectionState> {
        let manager = self
            .vpn
            .as_ref()
            .context("no VPN connection manager configured")?;

        let state = match manager.prepare().await {
            ConnectionState::ConsentNeeded { request } => {
                let outcome = self
                    .prompt
                    .ask(&request)
                    .await
                    .context("consent prompt failed")?;
                match outcome {
                    ConsentOutcome::Granted => manager.connect().await?,
                    ConsentOutcome::Denied => {
                        manager.deny_consent().await;
                        ConnectionState::ConsentDenied
                    }
                }
            }
            ConnectionState::AlreadyConsented => manager.connect().await?,
            other => other,
        };

        if state.is_connected() {
            tokio::time::sleep(self.settings.post_vpn_settle()).await;
        }
        Ok(state)
    }

    async fn start_local_server(&self) -> Result<(), BackendError> {
        let cache_dir = self.settings.server_cache_dir();
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(BackendError::LocalServer)?;

        info!("Starting server with cache dir: {}", cache_dir.display());
        self.local_server
            .start(&cache_dir)
            .await
            .map_err(BackendError::LocalServer)?;

        tokio::time::sleep(self.settings.local_server_settle()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tv_vpn::fake::{FakeBinder, FakeBlobSource, FakeTunnelService};
    use tv_vpn::{
        CONNECTED, ConfigCipher, ConsentRequest, EMBEDDED_CONFIG_URL, ManagerParts,
        PackageResolver, SecretConfigFetcher,
    };

    struct FakeServer {
        starts: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                starts: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                starts: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn starts(&self) -> Vec<PathBuf> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocalServer for FakeServer {
        async fn start(&self, cache_dir: &Path) -> io::Result<()> {
            self.starts.lock().unwrap().push(cache_dir.to_path_buf());
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }
            Ok(())
        }
    }

    struct FixedPrompt {
        outcome: ConsentOutcome,
        asked: AtomicUsize,
    }

    impl FixedPrompt {
        fn new(outcome: ConsentOutcome) -> Self {
            Self {
                outcome,
                asked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConsentPrompt for FixedPrompt {
        async fn ask(&self, _request: &ConsentRequest) -> io::Result<ConsentOutcome> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }
    }

    struct Installed;

    impl PackageResolver for Installed {
        fn is_installed(&self, _package: &str) -> bool {
            true
        }

        fn open_store(&self, _url: &str) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings(data_dir: &Path) -> Settings {
        Settings {
            data_dir: data_dir.to_path_buf(),
            ..Settings::default()
        }
    }

    fn vpn_manager(service: Arc<FakeTunnelService>, data_dir: &Path) -> Arc<VpnConnectionManager> {
        let cipher = ConfigCipher::embedded().unwrap();
        let blobs = Arc::new(FakeBlobSource::new(cipher.encrypt("client\n")));
        Arc::new(VpnConnectionManager::new(
            tv_vpn::VpnConfig::default(),
            data_dir,
            ManagerParts {
                packages: Arc::new(Installed),
                binder: Arc::new(FakeBinder::new(service)),
                fetcher: SecretConfigFetcher::new(blobs, cipher, EMBEDDED_CONFIG_URL),
            },
        ))
    }

    fn backend(
        settings: Settings,
        server: Arc<FakeServer>,
        vpn: Option<Arc<VpnConnectionManager>>,
        prompt: Arc<FixedPrompt>,
    ) -> Backend {
        Backend::new(
            settings,
            Arc::new(HttpClient::with_defaults()),
            BackendParts {
                local_server: server,
                vpn,
                prompt,
            },
        )
    }

    /// Serve one canned response and hand back the request line
    async fn serve_once(body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = tx.send(request.lines().next().unwrap_or_default().to_string());
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        (format!("http://{}", addr), rx)
    }

    #[tokio::test]
    async fn test_get_before_init_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            settings(dir.path()),
            Arc::new(FakeServer::new()),
            None,
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        );

        assert!(!backend.is_initialized());
        assert!(matches!(
            backend.get("/home").await,
            Err(BackendError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_remote_mode_gets_content() {
        let dir = tempfile::tempdir().unwrap();
        let (base, request) = serve_once("[\"news\",\"drama\"]").await;
        let server = Arc::new(FakeServer::new());
        let backend = backend(
            Settings {
                remote_server_url: base.clone(),
                ..settings(dir.path())
            },
            server.clone(),
            None,
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        );

        backend.init(BackendMode::Remote).await.unwrap();
        let response = backend.get("/home").await.unwrap();

        assert_eq!(backend.server_url().unwrap(), base);
        assert_eq!(response.text().unwrap(), "[\"news\",\"drama\"]");
        assert_eq!(request.await.unwrap(), "GET /home HTTP/1.1");
        assert!(server.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_mode_starts_server_once() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(FakeServer::new());
        let backend = Arc::new(backend(
            settings(dir.path()),
            server.clone(),
            None,
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        ));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                backend.init(BackendMode::Local).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        backend.init(BackendMode::Remote).await.unwrap();

        assert_eq!(server.starts(), vec![dir.path().join("server")]);
        assert!(dir.path().join("server").is_dir());
        assert_eq!(backend.server_url().unwrap(), "http://127.0.0.1:3000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_server_failure_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            settings(dir.path()),
            Arc::new(FakeServer::failing()),
            None,
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        );

        assert!(matches!(
            backend.init(BackendMode::Local).await,
            Err(BackendError::LocalServer(_))
        ));
        assert!(!backend.is_initialized());

        backend.init(BackendMode::Remote).await.unwrap();
        assert_eq!(backend.server_url().unwrap(), "http://192.168.1.2:3000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_consent_granted() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(
            FakeTunnelService::new()
                .with_consent(ConsentRequest {
                    token: "t".to_string(),
                    prompt: "Allow VPN?".to_string(),
                })
                .with_statuses(&["CONNECTING", CONNECTED]),
        );
        let prompt = Arc::new(FixedPrompt::new(ConsentOutcome::Granted));
        let server = Arc::new(FakeServer::new());
        let backend = backend(
            settings(dir.path()),
            server.clone(),
            Some(vpn_manager(service, dir.path())),
            prompt.clone(),
        );

        backend.init(BackendMode::LocalWithVpn).await.unwrap();

        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        assert!(backend.vpn_state().unwrap().is_connected());
        assert_eq!(server.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_consent_denied() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeTunnelService::new().with_consent(ConsentRequest {
            token: "t".to_string(),
            prompt: "Allow VPN?".to_string(),
        }));
        let server = Arc::new(FakeServer::new());
        let backend = backend(
            settings(dir.path()),
            server.clone(),
            Some(vpn_manager(service, dir.path())),
            Arc::new(FixedPrompt::new(ConsentOutcome::Denied)),
        );

        backend.init(BackendMode::LocalWithVpn).await.unwrap();

        assert!(matches!(
            backend.vpn_state(),
            Some(ConnectionState::ConsentDenied)
        ));
        assert_eq!(server.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeTunnelService::new().failing_prepare("no service"));
        let server = Arc::new(FakeServer::new());
        let backend = backend(
            settings(dir.path()),
            server.clone(),
            Some(vpn_manager(service, dir.path())),
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        );

        backend.init(BackendMode::LocalWithVpn).await.unwrap();

        assert!(backend.is_initialized());
        assert!(backend.vpn_state().unwrap().is_error());
        assert_eq!(server.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_mode_without_manager() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(FakeServer::new());
        let backend = backend(
            settings(dir.path()),
            server.clone(),
            None,
            Arc::new(FixedPrompt::new(ConsentOutcome::Granted)),
        );

        backend.init(BackendMode::LocalWithVpn).await.unwrap();

        assert!(backend.vpn_state().is_none());
        assert_eq!(server.starts().len(), 1);
    }
}

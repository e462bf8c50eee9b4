//! VPN Connection Manager
//!
//! Orchestrates consent, the bridge to the VPN client, the config fetcher
//! and the status monitor into one connection state machine.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = VpnConnectionManager::new(config, cache_dir, parts);
//!
//! match manager.prepare().await {
//!     ConnectionState::ConsentNeeded { request } => {
//!         // show `request` to the user, then either:
//!         manager.connect().await?;      // granted
//!         manager.deny_consent().await;  // denied
//!     }
//!     ConnectionState::AlreadyConsented => {
//!         manager.connect().await?;
//!     }
//!     other => warn!("VPN unavailable: {}", other),
//! }
//! ```
//!
//! # State machine
//!
//! ```text
//! NotInstalled ──prepare──▶ ConsentNeeded ──connect──▶ Connected
//!      │                        │   └──deny_consent──▶ ConsentDenied
//!      └──prepare──▶ AlreadyConsented ──connect──▶ Connected
//!
//! any remote/bind/fetch failure ──▶ ServiceError (retryable)
//! ```
//!
//! `Connected` and `ConsentDenied` are absorbing for the process lifetime.
//!
//! # Locking
//!
//! `prepare`, `connect` and `deny_consent` are serialized by one async
//! lock, held for the whole operation (including the wait for
//! `CONNECTED`), so only one negotiation is ever in flight. The last state
//! is also published on a watch channel for lock-free observation.

use crate::bridge::{BridgeError, ConsentRequest, ServiceBinder, TunnelClientBridge};
use crate::config::VpnConfig;
use crate::consent::{ConsentCoordinator, PackageResolver};
use crate::fetcher::{FetchError, SecretConfigFetcher};
use crate::status::{StatusCallback, StatusError, StatusMonitor, StatusStream};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// VPN client missing (also the state before the first `prepare`)
    NotInstalled,
    /// User must approve before a tunnel can start
    ConsentNeeded { request: ConsentRequest },
    /// Ready to connect
    AlreadyConsented,
    /// User refused; sticky until restart
    ConsentDenied,
    /// Tunnel is up
    Connected,
    /// Talking to the VPN client (or fetching its config) failed
    ServiceError { cause: Arc<ServiceFailure> },
}

impl ConnectionState {
    pub fn service_error(cause: impl Into<ServiceFailure>) -> Self {
        ConnectionState::ServiceError {
            cause: Arc::new(cause.into()),
        }
    }

    /// Check if the tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States that `prepare`/`connect` never leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::ConsentDenied)
    }

    /// Check if the last operation failed
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::ServiceError { .. })
    }

    /// Variant name, for logs and comparisons
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::NotInstalled => "NotInstalled",
            ConnectionState::ConsentNeeded { .. } => "ConsentNeeded",
            ConnectionState::AlreadyConsented => "AlreadyConsented",
            ConnectionState::ConsentDenied => "ConsentDenied",
            ConnectionState::Connected => "Connected",
            ConnectionState::ServiceError { .. } => "ServiceError",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::ServiceError { cause } => write!(f, "ServiceError({})", cause),
            other => f.write_str(other.name()),
        }
    }
}

/// Cause captured in [`ConnectionState::ServiceError`]
#[derive(Debug, thiserror::Error)]
pub enum ServiceFailure {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Tunnel config unavailable: {0}")]
    Config(#[from] FetchError),

    #[error(transparent)]
    Status(StatusError),
}

/// Errors `connect()` returns instead of capturing into state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Tunnel may still come up on its own; the state is left as it was
    #[error("Tunnel did not report CONNECTED within {0:?}")]
    Timeout(Duration),
}

/// How a single negotiation ended
enum Negotiation {
    TimedOut(Duration),
    Failed(ServiceFailure),
}

impl From<FetchError> for Negotiation {
    fn from(e: FetchError) -> Self {
        Negotiation::Failed(ServiceFailure::Config(e))
    }
}

impl From<BridgeError> for Negotiation {
    fn from(e: BridgeError) -> Self {
        Negotiation::Failed(ServiceFailure::Bridge(e))
    }
}

/// Collaborators the manager drives
pub struct ManagerParts {
    pub packages: Arc<dyn PackageResolver>,
    pub binder: Arc<dyn ServiceBinder>,
    pub fetcher: SecretConfigFetcher,
}

/// VPN Connection Manager
pub struct VpnConnectionManager {
    config: VpnConfig,
    cache_dir: PathBuf,
    state: Mutex<ConnectionState>,
    published: watch::Sender<ConnectionState>,
    consent: ConsentCoordinator,
    bridge: TunnelClientBridge,
    fetcher: SecretConfigFetcher,
    status: Arc<StatusStream>,
    monitor: StatusMonitor,
}

impl VpnConnectionManager {
    /// Create a manager in the `NotInstalled` state
    pub fn new(config: VpnConfig, cache_dir: impl Into<PathBuf>, parts: ManagerParts) -> Self {
        let consent = ConsentCoordinator::new(
            parts.packages,
            &config.client_package,
            &config.store_url(),
        );
        let bridge = TunnelClientBridge::new(parts.binder, config.bind_timeout());
        let status = Arc::new(StatusStream::new());
        let monitor = StatusMonitor::new(status.clone(), config.settle_delay());
        let (published, _) = watch::channel(ConnectionState::NotInstalled);

        Self {
            config,
            cache_dir: cache_dir.into(),
            state: Mutex::new(ConnectionState::NotInstalled),
            published,
            consent,
            bridge,
            fetcher: parts.fetcher,
            status,
            monitor,
        }
    }

    /// Last published state (does not wait for a running operation)
    pub fn state(&self) -> ConnectionState {
        self.published.borrow().clone()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.published.subscribe()
    }

    /// Status stream fed by the VPN client's callback
    pub fn status_stream(&self) -> Arc<StatusStream> {
        self.status.clone()
    }

    /// Check installation, bind the VPN client and ask for consent.
    ///
    /// Never fails: errors are captured as `ServiceError` and returned.
    pub async fn prepare(&self) -> ConnectionState {
        let mut state = self.state.lock().await;

        if state.is_terminal() {
            debug!("VPN already {}, nothing to do", state.name());
            return state.clone();
        }

        if !self.consent.ensure_installed() {
            self.transition(&mut state, ConnectionState::NotInstalled);
            return state.clone();
        }

        let next = match self.bridge.prepare_tunnel(&self.config.caller_identity).await {
            Ok(consent) => ConsentCoordinator::state_for(consent),
            Err(e) => {
                warn!("Error preparing VPN service: {}", e);
                ConnectionState::service_error(e)
            }
        };

        self.transition(&mut state, next);
        info!("Prepared VPN service: {}", &*state);
        state.clone()
    }

    /// Bring the tunnel up.
    ///
    /// Bridge and config failures are captured as `ServiceError` and
    /// returned as `Ok`. Before a successful `prepare()` this is a no-op
    /// returning `NotInstalled`. A timeout waiting for `CONNECTED` is returned as
    /// an error and leaves the state untouched.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectError> {
        let mut state = self.state.lock().await;

        match &*state {
            ConnectionState::Connected => {
                warn!("VPN is already connected, ignoring connect()");
                return Ok(state.clone());
            }
            ConnectionState::ConsentDenied => {
                debug!("VPN consent was denied, ignoring connect()");
                return Ok(state.clone());
            }
            ConnectionState::NotInstalled => {
                warn!("VPN client not installed or not prepared, ignoring connect()");
                return Ok(state.clone());
            }
            _ => {}
        }

        match self.negotiate().await {
            Ok(()) => {
                self.transition(&mut state, ConnectionState::Connected);
                Ok(state.clone())
            }
            Err(Negotiation::TimedOut(timeout)) => {
                warn!(
                    "VPN did not connect within {:?}; it may still be negotiating",
                    timeout
                );
                Err(ConnectError::Timeout(timeout))
            }
            Err(Negotiation::Failed(cause)) => {
                error!("Error while connecting to VPN: {}", cause);
                self.transition(&mut state, ConnectionState::service_error(cause));
                Ok(state.clone())
            }
        }
    }

    /// Record that the user refused consent
    pub async fn deny_consent(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, ConnectionState::ConsentDenied);
    }

    async fn negotiate(&self) -> Result<(), Negotiation> {
        let tunnel_config = self.fetcher.fetch(&self.cache_dir).await?;

        let callback: Arc<dyn StatusCallback> = self.status.clone();
        self.bridge.reregister_status_callback(callback).await?;

        // Subscribe before starting so no status pushed in between is lost.
        let wait = self.monitor.watch();
        self.bridge.start_tunnel(&tunnel_config).await?;

        match wait.await_connected(self.config.connect_timeout()).await {
            Ok(()) => Ok(()),
            Err(StatusError::Timeout(timeout)) => Err(Negotiation::TimedOut(timeout)),
            Err(e) => Err(Negotiation::Failed(ServiceFailure::Status(e))),
        }
    }

    fn transition(&self, state: &mut ConnectionState, next: ConnectionState) {
        if state.name() != next.name() {
            info!("VPN state {} -> {}", state, next);
        }
        *state = next.clone();
        self.published.send_replace(next);
    }
}

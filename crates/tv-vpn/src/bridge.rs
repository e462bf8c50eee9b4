//! Tunnel Client Bridge
//!
//! Holds the connection to the external VPN client's control interface.
//!
//! The interface itself is a capability trait ([`TunnelService`]) so the
//! real socket transport and the in-process fake are interchangeable.
//! Binding goes through a [`ServiceBinder`], is bounded by a timeout, and
//! the bound handle is memoized: the first successful bind is reused for
//! the rest of the process. A failed or timed-out bind leaves nothing
//! behind, so the next call tries again.

use crate::fetcher::TunnelConfig;
use crate::status::StatusCallback;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Opaque approval request returned by the VPN client.
///
/// Handed to the UI layer for presentation; the outcome comes back as
/// either a `connect()` (granted) or a `deny_consent()` (denied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    /// Handle the VPN client uses to match the approval
    pub token: String,
    /// Human-readable text to show the user
    pub prompt: String,
}

/// Failure reported by (or while talking to) the VPN client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote call `{call}` failed: {message}")]
    Call { call: &'static str, message: String },

    #[error("Remote call `{0}` timed out")]
    Timeout(&'static str),

    #[error("VPN client disconnected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Bridge errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("VPN client did not bind within {0:?}")]
    BindTimeout(Duration),

    #[error("Failed to bind VPN client: {0}")]
    BindFailed(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Control interface exposed by the external VPN client
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Ask whether `caller_identity` may start tunnels.
    ///
    /// `Some` means the user has to approve first.
    async fn prepare(&self, caller_identity: &str) -> Result<Option<ConsentRequest>, RemoteError>;

    /// Start a tunnel with the given configuration text
    async fn start_tunnel(&self, config: &TunnelConfig) -> Result<(), RemoteError>;

    async fn register_status_callback(
        &self,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError>;

    async fn unregister_status_callback(
        &self,
        callback: &Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError>;
}

/// Establishes a connection to the control interface
#[async_trait]
pub trait ServiceBinder: Send + Sync {
    async fn bind(&self) -> Result<Arc<dyn TunnelService>, BridgeError>;
}

/// Compare callbacks by identity
pub fn same_callback(a: &Arc<dyn StatusCallback>, b: &Arc<dyn StatusCallback>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Memoizing, timeout-bounded handle on the VPN client
pub struct TunnelClientBridge {
    binder: Arc<dyn ServiceBinder>,
    service: OnceCell<Arc<dyn TunnelService>>,
    bind_timeout: Duration,
}

impl TunnelClientBridge {
    pub fn new(binder: Arc<dyn ServiceBinder>, bind_timeout: Duration) -> Self {
        Self {
            binder,
            service: OnceCell::new(),
            bind_timeout,
        }
    }

    /// Has a bind succeeded yet?
    pub fn is_bound(&self) -> bool {
        self.service.initialized()
    }

    /// Bound service, binding first if needed
    pub async fn service(&self) -> Result<Arc<dyn TunnelService>, BridgeError> {
        let service = self
            .service
            .get_or_try_init(|| async {
                info!("Trying to bind with VPN client service");
                match tokio::time::timeout(self.bind_timeout, self.binder.bind()).await {
                    Ok(Ok(service)) => {
                        info!("Successfully bound with VPN client service");
                        Ok(service)
                    }
                    Ok(Err(e)) => {
                        warn!("Binding VPN client failed: {}", e);
                        Err(e)
                    }
                    Err(_) => {
                        warn!("Binding VPN client timed out after {:?}", self.bind_timeout);
                        Err(BridgeError::BindTimeout(self.bind_timeout))
                    }
                }
            })
            .await?;

        Ok(service.clone())
    }

    /// `Some(request)` when the user must approve this caller first
    pub async fn prepare_tunnel(
        &self,
        own_identity: &str,
    ) -> Result<Option<ConsentRequest>, BridgeError> {
        let service = self.service().await?;
        Ok(service.prepare(own_identity).await?)
    }

    pub async fn start_tunnel(&self, config: &TunnelConfig) -> Result<(), BridgeError> {
        let service = self.service().await?;
        debug!("Starting tunnel ({} bytes of config)", config.len());
        Ok(service.start_tunnel(config).await?)
    }

    pub async fn register_status_callback(
        &self,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<(), BridgeError> {
        let service = self.service().await?;
        Ok(service.register_status_callback(callback).await?)
    }

    pub async fn unregister_status_callback(
        &self,
        callback: &Arc<dyn StatusCallback>,
    ) -> Result<(), BridgeError> {
        let service = self.service().await?;
        Ok(service.unregister_status_callback(callback).await?)
    }

    /// Drop any earlier registration of `callback`, then register it again.
    ///
    /// Called before every tunnel start so repeated attempts never end up
    /// with the same callback registered twice.
    pub async fn reregister_status_callback(
        &self,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<(), BridgeError> {
        let service = self.service().await?;
        service.unregister_status_callback(&callback).await?;
        service.register_status_callback(callback).await?;
        Ok(())
    }
}

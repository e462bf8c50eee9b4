//! Control socket transport for the VPN client
//!
//! The VPN client exposes its control interface on a local Unix socket.
//!
//! # Protocol
//!
//! Messages use length-prefixed JSON framing:
//! - 4-byte big-endian length prefix
//! - JSON payload (max 1MB)
//!
//! We send [`ControlRequest`]s tagged with an id; the client answers each
//! with a `reply` frame carrying the same id. Once a status callback is
//! registered, the client also pushes unsolicited `status` frames on the
//! same connection. A background reader task routes replies to their
//! callers and statuses to the registered callback.

use crate::bridge::{
    BridgeError, ConsentRequest, RemoteError, ServiceBinder, TunnelService, same_callback,
};
use crate::fetcher::TunnelConfig;
use crate::status::{StatusCallback, StatusUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Timeout for a single request/reply exchange
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Request body sent to the VPN client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlCall {
    Prepare { caller: String },
    StartVpn { config: String },
    RegisterStatusCallback,
    UnregisterStatusCallback,
}

impl ControlCall {
    fn name(&self) -> &'static str {
        match self {
            ControlCall::Prepare { .. } => "prepare",
            ControlCall::StartVpn { .. } => "startVPN",
            ControlCall::RegisterStatusCallback => "registerStatusCallback",
            ControlCall::UnregisterStatusCallback => "unregisterStatusCallback",
        }
    }
}

/// Framed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u64,
    pub body: ControlCall,
}

/// Frames pushed by the VPN client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Reply {
        id: u64,
        #[serde(default)]
        consent: Option<ConsentRequest>,
        #[serde(default)]
        error: Option<String>,
    },
    Status(StatusUpdate),
}

/// Read a length-prefixed JSON message from an async reader
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON parse error: {}", e),
        )
    })
}

/// Write a length-prefixed JSON message to an async writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", json.len(), MAX_MESSAGE_SIZE),
        ));
    }

    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Reply {
    consent: Option<ConsentRequest>,
    error: Option<String>,
}

/// State shared between callers and the reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    callback: Mutex<Option<Arc<dyn StatusCallback>>>,
    closed: AtomicBool,
}

/// Binds by connecting to the VPN client's control socket
#[derive(Debug, Clone)]
pub struct SocketBinder {
    path: PathBuf,
    call_timeout: Duration,
}

impl SocketBinder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

#[async_trait]
impl ServiceBinder for SocketBinder {
    async fn bind(&self) -> Result<Arc<dyn TunnelService>, BridgeError> {
        debug!("Connecting to VPN control socket {}", self.path.display());
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| BridgeError::BindFailed(format!("{}: {}", self.path.display(), e)))?;

        info!("Connected to VPN control socket {}", self.path.display());
        Ok(Arc::new(SocketService::start(stream, self.call_timeout)))
    }
}

/// [`TunnelService`] over a connected control socket
pub struct SocketService {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: JoinHandle<()>,
}

impl SocketService {
    /// Take over a connected stream and start routing its frames
    pub fn start(stream: UnixStream, call_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader,
        }
    }

    async fn call(&self, body: ControlCall) -> Result<Option<ConsentRequest>, RemoteError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Disconnected);
        }

        let name = body.name();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        // The reader marks `closed` before draining `pending`.
        if self.shared.closed.load(Ordering::SeqCst) {
            lock(&self.shared.pending).remove(&id);
            return Err(RemoteError::Disconnected);
        }

        debug!("Sending control call {} ({})", id, name);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &ControlRequest { id, body }).await {
                lock(&self.shared.pending).remove(&id);
                return Err(RemoteError::Protocol(e.to_string()));
            }
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Reply { error: Some(message), .. })) => Err(RemoteError::Call { call: name, message }),
            Ok(Ok(Reply { consent, .. })) => Ok(consent),
            Ok(Err(_)) => Err(RemoteError::Disconnected),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(RemoteError::Timeout(name))
            }
        }
    }
}

impl Drop for SocketService {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        match read_frame::<_, ControlFrame>(&mut reader).await {
            Ok(ControlFrame::Reply { id, consent, error }) => {
                match lock(&shared.pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(Reply { consent, error });
                    }
                    None => debug!("Dropping reply for unknown call {}", id),
                }
            }
            Ok(ControlFrame::Status(update)) => {
                let callback = lock(&shared.callback).clone();
                match callback {
                    Some(callback) => callback.new_status(update),
                    None => debug!("Status received with no callback registered"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("VPN client closed the control socket");
                break;
            }
            Err(e) => {
                warn!("Control socket read failed: {}", e);
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call with Disconnected.
    lock(&shared.pending).clear();
}

#[async_trait]
impl TunnelService for SocketService {
    async fn prepare(&self, caller_identity: &str) -> Result<Option<ConsentRequest>, RemoteError> {
        self.call(ControlCall::Prepare {
            caller: caller_identity.to_string(),
        })
        .await
    }

    async fn start_tunnel(&self, config: &TunnelConfig) -> Result<(), RemoteError> {
        self.call(ControlCall::StartVpn {
            config: config.as_str().to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn register_status_callback(
        &self,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError> {
        self.call(ControlCall::RegisterStatusCallback).await?;
        *lock(&self.shared.callback) = Some(callback);
        Ok(())
    }

    async fn unregister_status_callback(
        &self,
        callback: &Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError> {
        self.call(ControlCall::UnregisterStatusCallback).await?;
        let mut slot = lock(&self.shared.callback);
        if slot.as_ref().is_some_and(|current| same_callback(current, callback)) {
            *slot = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CONNECTED, StatusStream};
    use tokio::net::UnixListener;

    /// Minimal VPN client: answers calls, pushes statuses after StartVpn
    fn spawn_vpn_client(listener: UnixListener) {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let request: ControlRequest = match read_frame(&mut stream).await {
                    Ok(request) => request,
                    Err(_) => break,
                };

                let reply = match &request.body {
                    ControlCall::Prepare { caller } if caller == "needs.consent" => {
                        ControlFrame::Reply {
                            id: request.id,
                            consent: Some(ConsentRequest {
                                token: "tok-1".to_string(),
                                prompt: "Allow?".to_string(),
                            }),
                            error: None,
                        }
                    }
                    ControlCall::StartVpn { config } if config.is_empty() => ControlFrame::Reply {
                        id: request.id,
                        consent: None,
                        error: Some("empty profile".to_string()),
                    },
                    _ => ControlFrame::Reply {
                        id: request.id,
                        consent: None,
                        error: None,
                    },
                };
                write_frame(&mut stream, &reply).await.unwrap();

                if matches!(&request.body, ControlCall::StartVpn { config } if !config.is_empty()) {
                    for state in ["", "CONNECTING", CONNECTED] {
                        let frame = ControlFrame::Status(StatusUpdate::state(state));
                        write_frame(&mut stream, &frame).await.unwrap();
                    }
                }
            }
        });
    }

    fn socket_pair() -> (tempfile::TempDir, PathBuf, UnixListener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, path, listener)
    }

    #[tokio::test]
    async fn test_prepare_over_socket() {
        let (_dir, path, listener) = socket_pair();
        spawn_vpn_client(listener);

        let service = SocketBinder::new(&path).bind().await.unwrap();

        assert_eq!(service.prepare("com.pbs.tv").await.unwrap(), None);
        let consent = service.prepare("needs.consent").await.unwrap();
        assert_eq!(consent.unwrap().token, "tok-1");
    }

    #[tokio::test]
    async fn test_statuses_reach_callback() {
        let (_dir, path, listener) = socket_pair();
        spawn_vpn_client(listener);

        let service = SocketBinder::new(&path).bind().await.unwrap();
        let stream = Arc::new(StatusStream::new());
        let callback: Arc<dyn StatusCallback> = stream.clone();
        let mut subscription = stream.subscribe();

        service.register_status_callback(callback).await.unwrap();
        service
            .start_tunnel(&TunnelConfig::new("client\n"))
            .await
            .unwrap();

        // The blank status is filtered out by the stream.
        assert_eq!(subscription.next().await.unwrap().state, "CONNECTING");
        assert_eq!(subscription.next().await.unwrap().state, CONNECTED);
    }

    #[tokio::test]
    async fn test_rejected_registration_gets_no_statuses() {
        let (_dir, path, listener) = socket_pair();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let request: ControlRequest = match read_frame(&mut stream).await {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let error = match request.body {
                    ControlCall::RegisterStatusCallback => Some("not allowed".to_string()),
                    _ => None,
                };
                let rejected = error.is_some();
                let reply = ControlFrame::Reply {
                    id: request.id,
                    consent: None,
                    error,
                };
                write_frame(&mut stream, &reply).await.unwrap();
                if rejected {
                    let status = ControlFrame::Status(StatusUpdate::state("CONNECTING"));
                    write_frame(&mut stream, &status).await.unwrap();
                }
            }
        });

        let service = SocketBinder::new(&path).bind().await.unwrap();
        let stream = Arc::new(StatusStream::new());
        let callback: Arc<dyn StatusCallback> = stream.clone();

        let result = service.register_status_callback(callback).await;
        assert!(matches!(
            result,
            Err(RemoteError::Call { call: "registerStatusCallback", .. })
        ));

        // The status frame is read before this reply, so it has been routed.
        assert_eq!(service.prepare("com.pbs.tv").await.unwrap(), None);
        assert!(stream.latest().is_none());
    }

    #[tokio::test]
    async fn test_remote_error_reply() {
        let (_dir, path, listener) = socket_pair();
        spawn_vpn_client(listener);

        let service = SocketBinder::new(&path).bind().await.unwrap();
        let result = service.start_tunnel(&TunnelConfig::new("")).await;

        assert_eq!(
            result,
            Err(RemoteError::Call {
                call: "startVPN",
                message: "empty profile".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_missing_socket_fails_bind() {
        let dir = tempfile::tempdir().unwrap();
        let result = SocketBinder::new(dir.path().join("absent.sock")).bind().await;

        assert!(matches!(result, Err(BridgeError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_calls() {
        let (_dir, path, listener) = socket_pair();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let service = SocketBinder::new(&path).bind().await.unwrap();
        let result = service.prepare("com.pbs.tv").await;

        assert!(matches!(
            result,
            Err(RemoteError::Disconnected | RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_frame_shapes() {
        let request = ControlRequest {
            id: 7,
            body: ControlCall::Prepare {
                caller: "com.pbs.tv".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"id":7,"body":{"method":"prepare","caller":"com.pbs.tv"}}"#
        );

        let status: ControlFrame =
            serde_json::from_str(r#"{"type":"status","state":"CONNECTED","level":"LEVEL_CONNECTED"}"#)
                .unwrap();
        assert_eq!(
            status,
            ControlFrame::Status(StatusUpdate {
                uuid: None,
                state: Some("CONNECTED".to_string()),
                message: None,
                level: Some("LEVEL_CONNECTED".to_string()),
            })
        );
    }
}

//! TV VPN - Tunnel provisioning for the private content backend
//!
//! The content backend is only reachable through a private tunnel. The
//! tunnel itself is run by an external, separately installed VPN client;
//! this crate provisions and supervises it from the application side.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Application Process                     │
//! │                                                              │
//! │  ┌──────────────────────┐    ┌─────────────────────────────┐ │
//! │  │ VpnConnectionManager │───▶│ SecretConfigFetcher         │─┼──▶ HTTP GET
//! │  │  (state machine)     │    │  (AES-CBC blob, 24h cache)  │ │   (bootstrap)
//! │  │                      │    └─────────────────────────────┘ │
//! │  │                      │───▶ ConsentCoordinator ────────────┼──▶ store page
//! │  │                      │                                    │
//! │  │                      │───▶ TunnelClientBridge ────────────┼──▶ VPN client
//! │  │                      │                                    │   control socket
//! │  │                      │◀─── StatusMonitor ◀── StatusStream ◀┼─── status pushes
//! │  └──────────────────────┘                                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Flow
//!
//! 1. `prepare()`: installation check, bind, ask the client for consent
//! 2. The UI shows the consent request if there is one
//! 3. `connect()`: fetch config, start the tunnel, wait for `CONNECTED`
//!
//! # Security
//!
//! The config blob is decrypted with a key and IV compiled into the
//! binary. That keeps the blob opaque on its public host, nothing more.

mod bridge;
mod cipher;
mod config;
mod consent;
pub mod fake;
mod fetcher;
#[cfg(unix)]
mod ipc;
mod manager;
mod status;

pub use bridge::{
    BridgeError, ConsentRequest, RemoteError, ServiceBinder, TunnelClientBridge, TunnelService,
    same_callback,
};
pub use cipher::{ConfigCipher, DecryptError, EMBEDDED_CONFIG_URL, deobfuscate_url};
pub use config::{ConfigError, VpnConfig};
pub use consent::{ConsentCoordinator, ConsentOutcome, PackageResolver, SystemPackages};
pub use fetcher::{BlobSource, FetchError, SecretConfigFetcher, TunnelConfig};
#[cfg(unix)]
pub use ipc::{ControlCall, ControlFrame, ControlRequest, SocketBinder, SocketService};
pub use manager::{
    ConnectError, ConnectionState, ManagerParts, ServiceFailure, VpnConnectionManager,
};
pub use status::{
    CONNECTED, ConnectWait, StatusCallback, StatusError, StatusEvent, StatusMonitor, StatusStream,
    StatusSubscription, StatusUpdate,
};

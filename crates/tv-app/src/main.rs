//! PBS TV
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! bootstraps the content backend (bringing the tunnel up if the mode
//! asks for it) and fetches the home page.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tv_app::{Backend, BackendParts, ProcessServer, Settings, TerminalPrompt};
use tv_network::HttpClient;
use tv_vpn::VpnConnectionManager;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("PBS TV starting...");

    let settings = Settings::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load settings")?;
    info!("Backend mode: {:?}", settings.mode);

    let http = Arc::new(HttpClient::with_defaults());
    let vpn = if settings.mode.uses_vpn() {
        Some(vpn_manager(&settings, http.clone())?)
    } else {
        None
    };

    let backend = Backend::new(
        settings.clone(),
        http,
        BackendParts {
            local_server: Arc::new(ProcessServer::new(settings.local_server_command.clone())),
            vpn,
            prompt: Arc::new(TerminalPrompt),
        },
    );

    backend
        .init(settings.mode)
        .await
        .context("Failed to initialize backend")?;

    let home = backend.get("/home").await.context("Failed to load home")?;
    info!("Home loaded: HTTP {} ({} bytes)", home.status, home.body.len());
    println!("{}", home.text().unwrap_or_default());

    info!("PBS TV shutting down");
    Ok(())
}

#[cfg(unix)]
fn vpn_manager(settings: &Settings, http: Arc<HttpClient>) -> Result<Arc<VpnConnectionManager>> {
    use tv_vpn::{ManagerParts, SecretConfigFetcher, SocketBinder, SystemPackages};

    let fetcher = SecretConfigFetcher::from_config(http, &settings.vpn)
        .context("Embedded tunnel key material is invalid")?;

    Ok(Arc::new(VpnConnectionManager::new(
        settings.vpn.clone(),
        &settings.data_dir,
        ManagerParts {
            packages: Arc::new(SystemPackages::new()),
            binder: Arc::new(SocketBinder::new(&settings.vpn.control_socket)),
            fetcher,
        },
    )))
}

#[cfg(not(unix))]
fn vpn_manager(_settings: &Settings, _http: Arc<HttpClient>) -> Result<Arc<VpnConnectionManager>> {
    anyhow::bail!("local-with-vpn mode needs the VPN client's Unix control socket")
}

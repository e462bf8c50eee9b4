//! Consent Coordination
//!
//! Decides whether a tunnel can be prepared at all (is the VPN client
//! installed?) and maps the client's prepare answer onto a
//! [`ConnectionState`].
//!
//! # Installation check
//!
//! On the desktop the VPN client's launch entry point is its XDG desktop
//! entry, named after the package identifier (`<package>.desktop`), in any
//! of the XDG data directories or the system-wide Flatpak exports.

use crate::bridge::ConsentRequest;
use crate::manager::ConnectionState;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of presenting a [`ConsentRequest`] to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentOutcome {
    Granted,
    Denied,
}

/// Platform package lookup and store redirect
pub trait PackageResolver: Send + Sync {
    /// Does `package` have a launchable entry point?
    fn is_installed(&self, package: &str) -> bool;

    /// Open the store page at `url`
    fn open_store(&self, url: &str) -> io::Result<()>;
}

/// Resolver backed by XDG desktop entries and the system URL handler
#[derive(Debug, Clone)]
pub struct SystemPackages {
    search_dirs: Vec<PathBuf>,
}

impl SystemPackages {
    /// Search the standard XDG application directories
    pub fn new() -> Self {
        let mut data_dirs = Vec::new();

        match std::env::var_os("XDG_DATA_HOME") {
            Some(dir) => data_dirs.push(PathBuf::from(dir)),
            None => {
                if let Some(home) = std::env::var_os("HOME") {
                    data_dirs.push(PathBuf::from(home).join(".local/share"));
                }
            }
        }

        let system = std::env::var("XDG_DATA_DIRS")
            .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
        data_dirs.extend(
            system
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        );
        data_dirs.push(PathBuf::from("/var/lib/flatpak/exports/share"));

        Self::with_dirs(data_dirs.into_iter().map(|d| d.join("applications")).collect())
    }

    /// Search only the given application directories
    pub fn with_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }
}

impl Default for SystemPackages {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageResolver for SystemPackages {
    fn is_installed(&self, package: &str) -> bool {
        let entry = format!("{}.desktop", package);
        self.search_dirs.iter().any(|dir| {
            let path = dir.join(&entry);
            let found = path.is_file();
            if found {
                debug!("Found launch entry {}", path.display());
            }
            found
        })
    }

    fn open_store(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

/// Installation check, store redirect and consent mapping
pub struct ConsentCoordinator {
    resolver: Arc<dyn PackageResolver>,
    client_package: String,
    store_url: String,
}

impl ConsentCoordinator {
    pub fn new(resolver: Arc<dyn PackageResolver>, client_package: &str, store_url: &str) -> Self {
        Self {
            resolver,
            client_package: client_package.to_string(),
            store_url: store_url.to_string(),
        }
    }

    pub fn client_package(&self) -> &str {
        &self.client_package
    }

    /// Is the VPN client installed?
    pub fn check_installed(&self) -> bool {
        self.resolver.is_installed(&self.client_package)
    }

    /// Send the user to the store to install the VPN client.
    ///
    /// Failing to open the store is logged, not returned: the caller
    /// reports `NotInstalled` either way.
    pub fn redirect_to_store(&self) {
        warn!(
            "{} is not installed, opening {} to install it",
            self.client_package, self.store_url
        );
        if let Err(e) = self.resolver.open_store(&self.store_url) {
            error!("Could not open store page {}: {}", self.store_url, e);
        }
    }

    /// `true` if installed; otherwise redirects to the store and returns `false`
    pub fn ensure_installed(&self) -> bool {
        if self.check_installed() {
            debug!("{} is already installed", self.client_package);
            true
        } else {
            self.redirect_to_store();
            false
        }
    }

    /// State after the VPN client answered a prepare call
    pub fn state_for(consent: Option<ConsentRequest>) -> ConnectionState {
        match consent {
            Some(request) => ConnectionState::ConsentNeeded { request },
            None => ConnectionState::AlreadyConsented,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePackages;
    use std::fs;

    const PACKAGE: &str = "de.blinkt.openvpn";
    const STORE: &str = "market://details?id=de.blinkt.openvpn";

    #[test]
    fn test_installed_skips_store() {
        let packages = Arc::new(FakePackages::new(true));
        let consent = ConsentCoordinator::new(packages.clone(), PACKAGE, STORE);

        assert!(consent.ensure_installed());
        assert!(packages.store_opens().is_empty());
    }

    #[test]
    fn test_missing_redirects_to_store() {
        let packages = Arc::new(FakePackages::new(false));
        let consent = ConsentCoordinator::new(packages.clone(), PACKAGE, STORE);

        assert!(!consent.ensure_installed());
        assert_eq!(packages.store_opens(), vec![STORE.to_string()]);
    }

    #[test]
    fn test_state_for_prepare_answer() {
        let request = ConsentRequest {
            token: "t".to_string(),
            prompt: "p".to_string(),
        };

        assert!(matches!(
            ConsentCoordinator::state_for(Some(request.clone())),
            ConnectionState::ConsentNeeded { request: r } if r == request
        ));
        assert!(matches!(
            ConsentCoordinator::state_for(None),
            ConnectionState::AlreadyConsented
        ));
    }

    #[test]
    fn test_desktop_entry_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("applications");
        fs::create_dir_all(&apps).unwrap();
        let packages = SystemPackages::with_dirs(vec![apps.clone()]);

        assert!(!packages.is_installed(PACKAGE));

        fs::write(apps.join("de.blinkt.openvpn.desktop"), "[Desktop Entry]\n").unwrap();
        assert!(packages.is_installed(PACKAGE));
        assert!(!packages.is_installed("org.example.other"));
    }
}

//! In-process test doubles
//!
//! Deterministic stand-ins for everything the connection manager talks to:
//! the VPN client's control interface, its binder, package resolution and
//! the blob download. Status sequences are replayed on a timer after
//! `start_tunnel`, so tests under a paused tokio clock see exact timings.

use crate::bridge::{
    BridgeError, ConsentRequest, RemoteError, ServiceBinder, TunnelService, same_callback,
};
use crate::consent::PackageResolver;
use crate::fetcher::{BlobSource, FetchError, TunnelConfig};
use crate::status::{StatusCallback, StatusUpdate};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call observed by [`FakeTunnelService`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Prepare(String),
    StartTunnel(String),
    RegisterStatusCallback,
    UnregisterStatusCallback,
}

/// Scriptable VPN client control interface
pub struct FakeTunnelService {
    consent: Mutex<Option<ConsentRequest>>,
    statuses: Mutex<Vec<String>>,
    status_interval: Duration,
    prepare_delay: Duration,
    prepare_error: Mutex<Option<String>>,
    start_error: Mutex<Option<String>>,
    callbacks: Mutex<Vec<Arc<dyn StatusCallback>>>,
    calls: Mutex<Vec<FakeCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTunnelService {
    /// Already-consented client that emits no statuses
    pub fn new() -> Self {
        Self {
            consent: Mutex::new(None),
            statuses: Mutex::new(Vec::new()),
            status_interval: Duration::from_millis(100),
            prepare_delay: Duration::ZERO,
            prepare_error: Mutex::new(None),
            start_error: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// `prepare` returns this consent request
    pub fn with_consent(self, request: ConsentRequest) -> Self {
        *lock(&self.consent) = Some(request);
        self
    }

    /// Statuses pushed to registered callbacks after `start_tunnel`
    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        self.set_statuses(statuses);
        self
    }

    /// Gap between scripted statuses (and before the first one)
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Make `prepare` take a while, to widen race windows
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    pub fn failing_prepare(self, message: &str) -> Self {
        *lock(&self.prepare_error) = Some(message.to_string());
        self
    }

    pub fn failing_start(self, message: &str) -> Self {
        *lock(&self.start_error) = Some(message.to_string());
        self
    }

    pub fn set_consent(&self, request: Option<ConsentRequest>) {
        *lock(&self.consent) = request;
    }

    /// Make `prepare` fail with `message`, or succeed again with `None`
    pub fn set_prepare_error(&self, message: Option<&str>) {
        *lock(&self.prepare_error) = message.map(str::to_string);
    }

    pub fn set_statuses(&self, statuses: &[&str]) {
        *lock(&self.statuses) = statuses.iter().map(|s| s.to_string()).collect();
    }

    /// Push a status to every registered callback right now
    pub fn emit(&self, state: &str) {
        deliver(&lock(&self.callbacks), state);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn registered_callbacks(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Highest number of overlapping `prepare`/`start_tunnel` calls seen
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: FakeCall) {
        lock(&self.calls).push(call);
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

impl Default for FakeTunnelService {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn deliver(callbacks: &[Arc<dyn StatusCallback>], state: &str) {
    for callback in callbacks {
        callback.new_status(StatusUpdate {
            uuid: Some("fake-profile".to_string()),
            state: Some(state.to_string()),
            message: None,
            level: Some("LEVEL_CONNECTED".to_string()),
        });
    }
}

#[async_trait]
impl TunnelService for FakeTunnelService {
    async fn prepare(&self, caller_identity: &str) -> Result<Option<ConsentRequest>, RemoteError> {
        let _guard = self.enter();
        self.record(FakeCall::Prepare(caller_identity.to_string()));

        if !self.prepare_delay.is_zero() {
            tokio::time::sleep(self.prepare_delay).await;
        }
        if let Some(message) = lock(&self.prepare_error).clone() {
            return Err(RemoteError::Call {
                call: "prepare",
                message,
            });
        }
        Ok(lock(&self.consent).clone())
    }

    async fn start_tunnel(&self, config: &TunnelConfig) -> Result<(), RemoteError> {
        let _guard = self.enter();
        self.record(FakeCall::StartTunnel(config.as_str().to_string()));

        if let Some(message) = lock(&self.start_error).clone() {
            return Err(RemoteError::Call {
                call: "startVPN",
                message,
            });
        }

        let statuses = lock(&self.statuses).clone();
        let callbacks = lock(&self.callbacks).clone();
        let interval = self.status_interval;
        tokio::spawn(async move {
            for state in statuses {
                tokio::time::sleep(interval).await;
                deliver(&callbacks, &state);
            }
        });
        Ok(())
    }

    async fn register_status_callback(
        &self,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError> {
        self.record(FakeCall::RegisterStatusCallback);
        let mut callbacks = lock(&self.callbacks);
        if !callbacks.iter().any(|c| same_callback(c, &callback)) {
            callbacks.push(callback);
        }
        Ok(())
    }

    async fn unregister_status_callback(
        &self,
        callback: &Arc<dyn StatusCallback>,
    ) -> Result<(), RemoteError> {
        self.record(FakeCall::UnregisterStatusCallback);
        lock(&self.callbacks).retain(|c| !same_callback(c, callback));
        Ok(())
    }
}

/// Binder handing out a shared [`FakeTunnelService`]
pub struct FakeBinder {
    service: Arc<FakeTunnelService>,
    delay: Mutex<Duration>,
    error: Option<String>,
    binds: AtomicUsize,
}

impl FakeBinder {
    pub fn new(service: Arc<FakeTunnelService>) -> Self {
        Self {
            service,
            delay: Mutex::new(Duration::ZERO),
            error: None,
            binds: AtomicUsize::new(0),
        }
    }

    /// Delay before the bind completes
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Bind attempts so far (including timed-out ones)
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceBinder for FakeBinder {
    async fn bind(&self) -> Result<Arc<dyn TunnelService>, BridgeError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.error {
            return Err(BridgeError::BindFailed(message.clone()));
        }
        Ok(self.service.clone())
    }
}

/// Package resolver with a switchable "installed" flag
pub struct FakePackages {
    installed: AtomicBool,
    store_opens: Mutex<Vec<String>>,
}

impl FakePackages {
    pub fn new(installed: bool) -> Self {
        Self {
            installed: AtomicBool::new(installed),
            store_opens: Mutex::new(Vec::new()),
        }
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
    }

    /// Store URLs opened so far
    pub fn store_opens(&self) -> Vec<String> {
        lock(&self.store_opens).clone()
    }
}

impl PackageResolver for FakePackages {
    fn is_installed(&self, _package: &str) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    fn open_store(&self, url: &str) -> io::Result<()> {
        lock(&self.store_opens).push(url.to_string());
        Ok(())
    }
}

/// Blob source returning a canned body (or failure) and counting calls
pub struct FakeBlobSource {
    body: Result<String, String>,
    calls: AtomicUsize,
    last_url: Mutex<Option<String>>,
}

impl FakeBlobSource {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: Ok(body.into()),
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            body: Err(message.to_string()),
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        lock(&self.last_url).clone()
    }
}

#[async_trait]
impl BlobSource for FakeBlobSource {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_url) = Some(url.to_string());
        self.body.clone().map_err(FetchError::Network)
    }
}

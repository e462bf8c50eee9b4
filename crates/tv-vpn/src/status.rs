//! Tunnel Status Monitoring
//!
//! The VPN client pushes `(id, state, message, level)` tuples through a
//! registered callback. [`StatusStream`] turns them into a publish/subscribe
//! channel that keeps the most recent event, so a new subscriber first
//! observes the last known status and then every later one.
//!
//! [`StatusMonitor`] resolves a single "became connected" signal from that
//! stream:
//!
//! - event #0 of a subscription is never accepted, even if it is
//!   `CONNECTED`, because it is usually the value replayed from a previous
//!   session
//! - the first later `CONNECTED` wins, followed by a settle delay
//! - the wait for `CONNECTED` is bounded by a timeout; the settle delay
//!   runs after it and does not count against it
//!
//! If nothing was ever published before subscribing, event #0 is a real
//! event and is still skipped. A client that goes straight to `CONNECTED`
//! without any intermediate state will then only be seen on its next
//! status push.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Status string the VPN client reports once the tunnel is up
pub const CONNECTED: &str = "CONNECTED";

/// Buffered events per subscriber before it starts lagging
const STREAM_CAPACITY: usize = 32;

/// A timestamped status string from the VPN client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub state: String,
    pub at: SystemTime,
}

impl StatusEvent {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            at: SystemTime::now(),
        }
    }

    /// Case-sensitive comparison against `CONNECTED`
    pub fn is_connected(&self) -> bool {
        self.state == CONNECTED
    }
}

/// Raw status push, as delivered by the VPN client's callback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub uuid: Option<String>,
    pub state: Option<String>,
    pub message: Option<String>,
    pub level: Option<String>,
}

impl StatusUpdate {
    /// Update carrying only a state
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: Some(state.into()),
            ..Self::default()
        }
    }
}

/// Receiver side of the VPN client's status callback
pub trait StatusCallback: Send + Sync {
    fn new_status(&self, update: StatusUpdate);
}

/// Status monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("Tunnel did not report CONNECTED within {0:?}")]
    Timeout(Duration),

    /// The [`StatusStream`] behind a subscription was dropped
    #[error("Status stream closed")]
    Closed,
}

/// Status channel with a one-slot replay buffer
pub struct StatusStream {
    latest: Mutex<Option<StatusEvent>>,
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusStream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            latest: Mutex::new(None),
            tx,
        }
    }

    /// Publish a status to all current subscribers and keep it for replay
    pub fn publish(&self, state: impl Into<String>) {
        let event = StatusEvent::new(state);
        // Held across the send so subscribe() never misses or doubles an event.
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = Some(event.clone());
        // No subscribers is fine; the event stays in the replay slot.
        let _ = self.tx.send(event);
    }

    /// Most recently published event
    pub fn latest(&self) -> Option<StatusEvent> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe: the replayed event (if any) comes first, then new ones
    pub fn subscribe(&self) -> StatusSubscription {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        StatusSubscription {
            replay: latest.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StatusStream {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCallback for StatusStream {
    fn new_status(&self, update: StatusUpdate) {
        match update.state {
            Some(state) if !state.trim().is_empty() => {
                debug!(
                    "VPN status changed: {:?} {} {:?} {:?}",
                    update.uuid, state, update.message, update.level
                );
                self.publish(state);
            }
            _ => debug!("Ignoring status update without a state"),
        }
    }
}

/// One subscriber's view of a [`StatusStream`]
pub struct StatusSubscription {
    replay: Option<StatusEvent>,
    rx: broadcast::Receiver<StatusEvent>,
}

impl StatusSubscription {
    /// Next event, waiting if none is buffered
    pub async fn next(&mut self) -> Result<StatusEvent, StatusError> {
        if let Some(event) = self.replay.take() {
            return Ok(event);
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Status subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return Err(StatusError::Closed),
            }
        }
    }
}

/// Waits for the tunnel to report `CONNECTED`
pub struct StatusMonitor {
    stream: Arc<StatusStream>,
    settle: Duration,
}

impl StatusMonitor {
    pub fn new(stream: Arc<StatusStream>, settle: Duration) -> Self {
        Self { stream, settle }
    }

    /// Subscribe now, wait later.
    ///
    /// Lets the caller subscribe before kicking off the tunnel so no status
    /// pushed in between is lost.
    pub fn watch(&self) -> ConnectWait {
        ConnectWait {
            subscription: self.stream.subscribe(),
            settle: self.settle,
        }
    }

    /// Subscribe and wait for a fresh `CONNECTED`
    pub async fn await_connected(&self, timeout: Duration) -> Result<(), StatusError> {
        self.watch().await_connected(timeout).await
    }
}

/// A pending wait for `CONNECTED` on a live subscription
pub struct ConnectWait {
    subscription: StatusSubscription,
    settle: Duration,
}

impl ConnectWait {
    /// Wait up to `timeout` for a fresh `CONNECTED`, then settle.
    ///
    /// The settle delay starts once `CONNECTED` is seen and is not counted
    /// against `timeout`.
    pub async fn await_connected(mut self, timeout: Duration) -> Result<(), StatusError> {
        let subscription = &mut self.subscription;

        let wait = async move {
            let mut index = 0usize;
            loop {
                let event = subscription.next().await?;
                info!("Received new VPN status: {} {}", index, event.state);
                if index > 0 && event.is_connected() {
                    return Ok::<(), StatusError>(());
                }
                index += 1;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("No {} status within {:?}", CONNECTED, timeout);
                return Err(StatusError::Timeout(timeout));
            }
        }

        debug!("Tunnel connected, settling for {:?}", self.settle);
        tokio::time::sleep(self.settle).await;
        Ok(())
    }
}

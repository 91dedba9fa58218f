use std::{sync::Mutex, time::Duration};

use futures_util::future::BoxFuture;
use tokio::sync::{MutexGuard, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Classify, ErrorKind};

/// The pause between two connection attempts.
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// The connection state of a [VsockBridge].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Closed,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Disconnected => write!(f, "disconnected"),
            BridgeState::Connecting => write!(f, "connecting"),
            BridgeState::Connected => write!(f, "connected"),
            BridgeState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub enum VsockError {
    Unavailable { port: u32, waited: Duration },
    NotConnected,
    Closed,
}

impl std::error::Error for VsockError {}

impl std::fmt::Display for VsockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VsockError::Unavailable { port, waited } => {
                write!(f, "The guest did not accept a vsock connection on port {port} within {waited:?}")
            }
            VsockError::NotConnected => write!(f, "The vsock bridge is not connected"),
            VsockError::Closed => write!(f, "The vsock bridge was closed"),
        }
    }
}

impl Classify for VsockError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::VsockUnavailable
    }
}

/// Produces a fresh connection to a guest vsock port.
pub type Connector<C> = Box<dyn Fn(u32) -> BoxFuture<'static, Result<C, std::io::Error>> + Send + Sync>;

/// Owns the single connection to one guest vsock port and publishes its state.
///
/// Connections are made by [VsockBridge::dial], which retries until the guest starts listening or a deadline
/// passes. Users borrow the connection through a [StreamLease]; leases are granted in FIFO order, and a holder that
/// hits an I/O error hands the connection back with [StreamLease::mark_disconnected]. Once closed, the bridge drops
/// its connection and every state observer.
pub struct VsockBridge<C> {
    port: u32,
    connector: Connector<C>,
    state: Mutex<BridgeState>,
    observers: Mutex<Option<watch::Sender<BridgeState>>>,
    stream: tokio::sync::Mutex<Option<C>>,
    dial_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
}

impl<C: Send + 'static> std::fmt::Debug for VsockBridge<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsockBridge")
            .field("port", &self.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> VsockBridge<C> {
    pub fn new(port: u32, connector: Connector<C>) -> Self {
        let (observers, _) = watch::channel(BridgeState::Disconnected);
        Self {
            port,
            connector,
            state: Mutex::new(BridgeState::Disconnected),
            observers: Mutex::new(Some(observers)),
            stream: tokio::sync::Mutex::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Observe state transitions. After the bridge is closed, the returned receiver reports `closed` and its
    /// `changed()` fails.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        match self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            Some(observers) => observers.subscribe(),
            None => watch::channel(BridgeState::Closed).1,
        }
    }

    fn transition(&self, next: BridgeState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == BridgeState::Closed || *state == next {
            return false;
        }
        let previous = std::mem::replace(&mut *state, next);
        tracing::debug!(port = self.port, from = %previous, to = %next, "vsock bridge state changed");

        let mut observers = self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = observers.as_ref() {
            sender.send_replace(next);
        }
        if next == BridgeState::Closed {
            observers.take();
        }
        true
    }

    /// Connect to the guest port, retrying every [DIAL_RETRY_INTERVAL] until `timeout` elapses. Succeeds at once if
    /// already connected.
    pub async fn dial(&self, timeout: Duration) -> Result<(), VsockError> {
        let _dialing = self.dial_lock.lock().await;
        match self.state() {
            BridgeState::Connected => return Ok(()),
            BridgeState::Closed => return Err(VsockError::Closed),
            _ => {}
        }

        self.transition(BridgeState::Connecting);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = tokio::select! {
                _ = self.closed.cancelled() => return Err(VsockError::Closed),
                attempt = tokio::time::timeout_at(deadline, (self.connector)(self.port)) => attempt,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    let mut slot = self.stream.lock().await;
                    if self.closed.is_cancelled() {
                        return Err(VsockError::Closed);
                    }
                    *slot = Some(stream);
                    self.transition(BridgeState::Connected);
                    tracing::info!(port = self.port, attempts, "vsock bridge connected");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    tracing::trace!(port = self.port, attempts, error = %err, "vsock connect attempt failed");
                }
                Err(_) => break,
            }

            if tokio::time::Instant::now() + DIAL_RETRY_INTERVAL >= deadline {
                break;
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Err(VsockError::Closed),
                _ = tokio::time::sleep(DIAL_RETRY_INTERVAL) => {}
            }
        }

        self.transition(BridgeState::Disconnected);
        tracing::warn!(port = self.port, attempts, ?timeout, "vsock bridge could not connect");
        Err(VsockError::Unavailable {
            port: self.port,
            waited: timeout,
        })
    }

    /// Borrow the connection, waiting behind earlier borrowers.
    pub async fn lease(&self) -> Result<StreamLease<'_, C>, VsockError> {
        let guard = self.stream.lock().await;
        if self.closed.is_cancelled() {
            return Err(VsockError::Closed);
        }
        if guard.is_none() {
            return Err(VsockError::NotConnected);
        }
        Ok(StreamLease { guard, bridge: self })
    }

    /// Resolves once the bridge is closed.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Drop the connection and all observers. Closing is permanent.
    pub async fn close(&self) {
        self.closed.cancel();
        self.transition(BridgeState::Closed);
        self.stream.lock().await.take();
    }
}

/// Exclusive access to a [VsockBridge]'s connection.
pub struct StreamLease<'a, C: Send + 'static> {
    guard: MutexGuard<'a, Option<C>>,
    bridge: &'a VsockBridge<C>,
}

impl<C: Send + 'static> StreamLease<'_, C> {
    pub fn stream(&mut self) -> &mut C {
        match self.guard.as_mut() {
            Some(stream) => stream,
            None => unreachable!("a lease is only granted over a live connection"),
        }
    }

    /// Give the connection up after an I/O failure; the bridge becomes `disconnected`.
    pub fn mark_disconnected(mut self) {
        self.guard.take();
        self.bridge.transition(BridgeState::Disconnected);
    }
}

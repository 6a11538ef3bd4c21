//! Broker connection supervision.
//!
//! [`ConnectionSupervisor::run`] owns the connect / watch / reconnect cycle
//! as a plain loop: connect with a fixed delay between failures, publish the
//! handle, wait for the close signal or for the handle to stop being usable,
//! drop the handle and start over. Callers
//! read the handle through [`ConnectionSupervisor::current`] on every use and
//! never keep it across a reconnect.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{RwLock, oneshot, watch},
    time::sleep,
};
use tracing::{info, warn};

use crate::error::BrokerError;

/// How often a published handle is checked for closures that bypass the
/// close signal, such as a channel closed by the server on a live connection.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A freshly established session and the signal that fires when it dies.
pub struct Connected<H> {
    pub handle: H,
    pub closed: oneshot::Receiver<String>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Connects, opens a channel and declares the topology.
    async fn connect(&self) -> Result<Connected<Self::Handle>, BrokerError>;

    /// Whether a published handle can still be used.
    fn is_usable(&self, _handle: &Self::Handle) -> bool {
        true
    }

    async fn close(&self, _handle: Self::Handle) {}
}

pub struct ConnectionSupervisor<C: BrokerConnector> {
    connector: C,
    reconnect_delay: Duration,
    health_check_interval: Duration,
    current: RwLock<Option<C::Handle>>,
    generation: AtomicU64,
}

impl<C: BrokerConnector> ConnectionSupervisor<C> {
    pub fn new(connector: C, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            reconnect_delay,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Live handle, or `None` while disconnected or when the handle went stale.
    pub async fn current(&self) -> Option<C::Handle> {
        let guard = self.current.read().await;
        guard
            .as_ref()
            .filter(|handle| self.connector.is_usable(handle))
            .cloned()
    }

    pub async fn is_ready(&self) -> bool {
        self.current().await.is_some()
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Retries `connect` every `reconnect_delay` until it succeeds or shutdown fires.
    async fn connect_until_ready(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Connected<C::Handle>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            match self.connector.connect().await {
                Ok(connected) => return Some(connected),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = self.reconnect_delay.as_secs_f64(),
                        "Broker connection attempt failed"
                    );
                }
            }

            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    /// Resolves once `handle` is no longer usable.
    async fn until_unusable(&self, handle: &C::Handle) {
        loop {
            sleep(self.health_check_interval).await;
            if !self.connector.is_usable(handle) {
                return;
            }
        }
    }

    /// Supervises the connection until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(Connected { handle, closed }) = self.connect_until_ready(&mut shutdown).await
            else {
                break;
            };

            let watched = handle.clone();
            *self.current.write().await = Some(handle);
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(generation, "Broker connected, topology declared");

            tokio::select! {
                reason = closed => {
                    let reason = reason.unwrap_or_else(|_| "close watcher dropped".to_string());
                    warn!(%reason, "Broker connection closed, reconnecting");
                    self.current.write().await.take();
                }
                _ = self.until_unusable(&watched) => {
                    warn!(generation, "Broker channel no longer usable, reconnecting");
                    let stale = self.current.write().await.take();
                    if let Some(stale) = stale {
                        self.connector.close(stale).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let handle = self.current.write().await.take();
        if let Some(handle) = handle {
            self.connector.close(handle).await;
        }
        info!("Broker supervisor stopped");
    }
}

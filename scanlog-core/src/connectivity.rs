//! Connectivity monitor
//!
//! Holds the process-wide [`ConnectivityState`] in a `watch` channel. The
//! monitor is the only writer; the sync engine holds a receiver and gates
//! its attempts on it. State changes come either from host network-status
//! notifications ([`ConnectivityMonitor::report`]) or, when the host has
//! none, from a periodic liveness probe ([`ConnectivityMonitor::run_probe`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Whether the remote API is reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }

    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness check used when the host gives no network-change notifications
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Owner of the connectivity state
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        tracing::info!(state = %initial, "Connectivity initialized");
        Self { tx: Arc::new(tx) }
    }

    /// Initialize from a single probe, the runtime's view at startup.
    pub async fn detect(probe: &dyn ConnectivityProbe) -> Self {
        Self::new(ConnectivityState::from_reachable(probe.is_reachable().await))
    }

    pub fn current(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Receiver for the sync engine and other observers
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Record a network-status notification. Returns true on a transition.
    pub fn report(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            match state {
                ConnectivityState::Online => tracing::info!("Network: online, resuming sync"),
                ConnectivityState::Offline => tracing::warn!("Network: offline, suspending sync"),
            }
        }
        changed
    }

    /// Probe every `interval` until `shutdown` is cancelled.
    ///
    /// The first probe runs immediately.
    pub async fn run_probe(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reachable = probe.is_reachable().await;
                    tracing::trace!(reachable, "Liveness probe");
                    self.report(ConnectivityState::from_reachable(reachable));
                }
            }
        }

        tracing::debug!("Liveness probe stopped");
    }
}

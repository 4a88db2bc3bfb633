//! Single-fire shutdown and the drain that follows it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::relay::{RelayRegistry, RelayReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    SignalingLost,
    Interrupted,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::SignalingLost => f.write_str("signaling connection lost"),
            ShutdownReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Cloneable trigger that fires at most once; later triggers are ignored.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true only for the call that actually fired the signal.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let fired = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if fired {
            debug!(target = "supervisor", %reason, "shutdown triggered");
        }
        fired
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub async fn triggered(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| *reason)
            .unwrap_or(ShutdownReason::Interrupted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Draining,
    Terminated,
}

/// Whatever owns the media transport; closing it ends every track read.
#[async_trait]
pub trait PeerTeardown: Send + Sync {
    async fn teardown(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    pub reason: ShutdownReason,
    pub reports: Vec<RelayReport>,
}

pub struct Supervisor {
    signal: ShutdownSignal,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            signal,
            state: Mutex::new(SupervisorState::Running),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Wait for the shutdown signal, then drain. A second caller gets
    /// `None` once another has started the drain.
    pub async fn run(
        &self,
        peer: &dyn PeerTeardown,
        relays: &RelayRegistry,
    ) -> Option<DrainSummary> {
        let reason = self.signal.triggered().await;
        self.drain(reason, peer, relays).await
    }

    async fn drain(
        &self,
        reason: ShutdownReason,
        peer: &dyn PeerTeardown,
        relays: &RelayRegistry,
    ) -> Option<DrainSummary> {
        {
            let mut state = self.state.lock();
            if *state != SupervisorState::Running {
                return None;
            }
            *state = SupervisorState::Draining;
        }

        info!(target = "supervisor", %reason, "shutting down; closing peer connection");
        peer.teardown().await;
        info!(target = "supervisor", "waiting for track relays to finish");
        let reports = relays.drain().await;
        *self.state.lock() = SupervisorState::Terminated;
        info!(target = "supervisor", relays = reports.len(), "shutdown complete");

        Some(DrainSummary { reason, reports })
    }
}

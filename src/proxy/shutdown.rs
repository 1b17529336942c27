//! Graceful shutdown coordination.
//!
//! Every connection handler registers here on entry and deregisters on every
//! exit path (via the RAII guard). `shutdown` flips the shutting-down flag,
//! cancels the root token so handlers stop taking new work, waits for the
//! drain counter to reach zero within the deadline, then force-closes
//! whatever is left through the per-connection child tokens and gives
//! handlers one more second to clean up.

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct ShutdownCoordinator {
    connections: RwLock<HashMap<String, CancellationToken>>,
    active: watch::Sender<usize>,
    shutting_down: AtomicBool,
    root: CancellationToken,
    seq: AtomicU64,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        let (active, _) = watch::channel(0usize);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            active,
            shutting_down: AtomicBool::new(false),
            root: CancellationToken::new(),
            seq: AtomicU64::new(0),
        })
    }

    /// Register a transport; the returned guard deregisters on drop.
    pub fn track(self: &Arc<Self>, remote: SocketAddr, local: SocketAddr) -> TrackedConnection {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{remote}->{local}#{seq}");
        // Independent of the root token: force-close fires only after the
        // drain deadline, never on the graceful signal.
        let force = CancellationToken::new();

        self.connections
            .write()
            .expect("connection registry lock")
            .insert(id.clone(), force.clone());
        self.active.send_modify(|n| *n += 1);

        TrackedConnection {
            coordinator: Arc::clone(self),
            id,
            force,
        }
    }

    /// Remove a transport from tracking and decrement the drain counter.
    pub fn untrack(&self, id: &str) {
        let removed = self
            .connections
            .write()
            .expect("connection registry lock")
            .remove(id)
            .is_some();
        if removed {
            self.active.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Root cancellation token; cancelled when shutdown begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Drain active connections within `timeout`, then force-close the rest.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.root.cancel();

        if self.wait_for_drain(timeout).await {
            debug!("all connections closed gracefully");
            return Ok(());
        }

        let remaining: Vec<(String, CancellationToken)> = {
            let connections = self.connections.write().expect("connection registry lock");
            connections
                .iter()
                .map(|(id, token)| (id.clone(), token.clone()))
                .collect()
        };
        warn!(
            count = remaining.len(),
            "drain deadline reached, force-closing remaining connections"
        );
        for (id, token) in remaining {
            debug!(connection = %id, "force closing");
            token.cancel();
        }

        if self.wait_for_drain(FORCE_CLOSE_GRACE).await {
            Ok(())
        } else {
            Err(ProxyError::ShutdownTimeout(self.active_connections()))
        }
    }

    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }
}

/// RAII registration for one transport.
pub struct TrackedConnection {
    coordinator: Arc<ShutdownCoordinator>,
    id: String,
    force: CancellationToken,
}

impl TrackedConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when this connection is force-closed.
    pub fn force_close(&self) -> CancellationToken {
        self.force.clone()
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.coordinator.untrack(&self.id);
    }
}

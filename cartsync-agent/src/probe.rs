//! Reachability probe.
//!
//! The client's own online flag only says a network interface is up. The
//! probe periodically asks the storefront whether it can actually be reached
//! and feeds the answer into the [`ConnectivityMonitor`], so an
//! offline -> online transition (and the drain it triggers) also happens
//! when the server comes back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cartsync_core::ConnectivityMonitor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::metrics;

/// Something that can tell whether the storefront answers.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether the remote is reachable right now.
    async fn is_reachable(&self) -> bool;
}

/// Handle to a running probe.
pub struct ProbeHandle {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProbeHandle {
    /// Whether the probe task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the probe and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Reachability probe task failed");
            }
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the probe.
///
/// The first check runs one `interval` after start; the initial state comes
/// from configuration.
pub fn spawn_reachability_probe(
    target: Arc<dyn Reachability>,
    monitor: ConnectivityMonitor,
    interval: Duration,
) -> ProbeHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Don't fire immediately on start
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Reachability probe received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let reachable = target.is_reachable().await;
                    tracing::trace!(reachable, "Reachability probe tick");
                    if let Some(event) = monitor.set_online(reachable) {
                        tracing::info!(?event, "Storefront reachability changed");
                        metrics::set_connectivity(reachable);
                    }
                }
            }
        }
    });

    ProbeHandle {
        handle,
        shutdown_tx: Some(shutdown_tx),
    }
}

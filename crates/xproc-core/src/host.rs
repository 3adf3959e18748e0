//! Loopback TCP host for a [`ServiceRegistry`].
//!
//! Listens on a local address (port `0` lets the OS pick). Each accepted
//! caller becomes a [`TcpChannel`] whose handshake and transactions the
//! registry serves on a task of its own. At most
//! [`TransportConfig::MAX_HOST_CONNECTIONS`] channels are open at once.

use crate::config::TransportConfig;
use crate::error::Result;
use crate::registry::ServiceRegistry;
use crate::transport::{Channel, TcpChannel};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running host. Dropping shuts it down.
pub struct ServiceHostHandle {
    pub addr: SocketAddr,
    pub port: u16,
    open_channels: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    closing_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServiceHostHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of callers currently connected.
    pub fn active_connections(&self) -> usize {
        self.open_channels.load(Ordering::Acquire)
    }

    /// Stop accepting callers and close every open channel. Callers observe
    /// the host as a dead remote.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.closing_tx.send(true);
    }
}

impl Drop for ServiceHostHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// TCP front end for a registry.
pub struct ServiceHost;

impl ServiceHost {
    /// Start listening on `addr`, e.g. `127.0.0.1:0`.
    pub async fn start(registry: Arc<ServiceRegistry>, addr: &str) -> Result<ServiceHostHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!(
            "Service host listening on {} ({})",
            addr,
            registry.interfaces().join(", ")
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (closing_tx, closing_rx) = watch::channel(false);
        let open_channels = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            shutdown_rx,
            closing_rx,
            open_channels.clone(),
        ));

        Ok(ServiceHostHandle {
            addr,
            port,
            open_channels,
            shutdown_tx: Some(shutdown_tx),
            closing_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<ServiceRegistry>,
        mut stop_rx: oneshot::Receiver<()>,
        closing_rx: watch::Receiver<bool>,
        open_channels: Arc<AtomicUsize>,
    ) {
        loop {
            let (stream, caller) = tokio::select! {
                _ = &mut stop_rx => {
                    info!("Service host stopped accepting callers");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accepting a caller failed: {}", e);
                        continue;
                    }
                },
            };

            // Dropping the stream makes the caller's handshake see a dead remote.
            let Some(slot) = ChannelSlot::claim(&open_channels) else {
                warn!(
                    "Refusing caller {}: {} channels already open",
                    caller,
                    TransportConfig::MAX_HOST_CONNECTIONS
                );
                continue;
            };

            let channel: Arc<dyn Channel> = match TcpChannel::new(stream) {
                Ok(channel) => Arc::new(channel),
                Err(e) => {
                    warn!("No channel for caller {}: {}", caller, e);
                    continue;
                }
            };

            debug!("Caller {} opened a channel", caller);
            tokio::spawn(Self::serve_until_closed(
                registry.clone(),
                channel,
                closing_rx.clone(),
                slot,
            ));
        }
    }

    /// Serve one caller's transactions until the caller leaves or the host
    /// closes. The slot is released when this returns.
    async fn serve_until_closed(
        registry: Arc<ServiceRegistry>,
        channel: Arc<dyn Channel>,
        mut closing_rx: watch::Receiver<bool>,
        _slot: ChannelSlot,
    ) {
        let peer = channel.peer();
        tokio::select! {
            result = registry.serve_channel(channel.clone()) => match result {
                Ok(()) => debug!("Caller {} closed its channel", peer),
                Err(e) => debug!("Channel {} ended: {}", peer, e),
            },
            _ = closing_rx.changed() => {
                if let Err(e) = channel.unbind().await {
                    debug!("Closing {} on shutdown: {}", peer, e);
                }
            }
        }
    }
}

/// One counted open channel. Claiming fails once the host is at capacity.
struct ChannelSlot {
    open_channels: Arc<AtomicUsize>,
}

impl ChannelSlot {
    fn claim(open_channels: &Arc<AtomicUsize>) -> Option<Self> {
        open_channels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < TransportConfig::MAX_HOST_CONNECTIONS).then_some(open + 1)
            })
            .ok()?;
        Some(Self {
            open_channels: open_channels.clone(),
        })
    }
}

impl Drop for ChannelSlot {
    fn drop(&mut self) {
        self.open_channels.fetch_sub(1, Ordering::AcqRel);
    }
}

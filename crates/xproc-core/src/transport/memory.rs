//! In-process transport.
//!
//! Each bind creates a pair of bounded frame queues sharing one liveness flag.
//! Killing a target flips the flag on every channel bound to it, which both
//! ends observe exactly like a remote process dying.

use super::{check_frame_size, Channel, Transport};
use crate::config::TransportConfig;
use crate::error::{Result, XprocError};
use crate::registry::ServiceRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Liveness shared by both ends of a channel pair.
struct Link {
    dead: watch::Sender<bool>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (dead, _) = watch::channel(false);
        Arc::new(Self { dead })
    }

    fn kill(&self) {
        self.dead.send_replace(true);
    }

    fn is_dead(&self) -> bool {
        *self.dead.borrow()
    }

    async fn wait_dead(&self) {
        let mut rx = self.dead.subscribe();
        // The sender lives as long as `self`, so this only returns once killed.
        let _ = rx.wait_for(|dead| *dead).await;
    }
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    link: Arc<Link>,
    peer: String,
}

impl MemoryChannel {
    /// Create a connected pair: `(caller end, host end)`.
    pub fn pair(target: &str) -> (Self, Self) {
        Self::pair_with_link(target, Link::new())
    }

    fn pair_with_link(target: &str, link: Arc<Link>) -> (Self, Self) {
        let capacity = TransportConfig::MEMORY_CHANNEL_CAPACITY;
        let (to_host, from_caller) = mpsc::channel(capacity);
        let (to_caller, from_host) = mpsc::channel(capacity);

        let caller = Self {
            tx: to_host,
            rx: tokio::sync::Mutex::new(from_host),
            link: link.clone(),
            peer: format!("memory:{}", target),
        };
        let host = Self {
            tx: to_caller,
            rx: tokio::sync::Mutex::new(from_caller),
            link,
            peer: format!("memory:{}:caller", target),
        };
        (caller, host)
    }

    fn closed(&self) -> XprocError {
        XprocError::Transport {
            message: format!("channel to {} is closed", self.peer),
            source: None,
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.link.is_dead() {
            return Err(self.closed());
        }
        check_frame_size(frame.len())?;
        self.tx.send(frame).await.map_err(|_| self.closed())
    }

    async fn receive(&self) -> Result<Option<Bytes>> {
        if self.link.is_dead() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.link.wait_dead() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn unbind(&self) -> Result<()> {
        self.link.kill();
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.link.kill();
    }
}

struct Endpoint {
    registry: Arc<ServiceRegistry>,
    links: Vec<Weak<Link>>,
}

/// Transport whose targets are service registries living in this process.
#[derive(Default)]
pub struct MemoryTransport {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `registry` reachable as `target`.
    pub fn register(&self, target: impl Into<String>, registry: Arc<ServiceRegistry>) {
        let target = target.into();
        debug!("Memory endpoint registered: {}", target);
        self.lock().insert(
            target,
            Endpoint {
                registry,
                links: Vec::new(),
            },
        );
    }

    /// Simulate the death of the process behind `target`.
    ///
    /// Every channel bound to it is closed and the target stops accepting
    /// binds. Returns the number of live channels that were severed.
    pub fn kill(&self, target: &str) -> usize {
        let Some(endpoint) = self.lock().remove(target) else {
            return 0;
        };
        let links: Vec<Arc<Link>> = endpoint.links.iter().filter_map(Weak::upgrade).collect();
        for link in &links {
            link.kill();
        }
        info!("Memory endpoint {} killed ({} channels)", target, links.len());
        links.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self, target: &str) -> Result<Arc<dyn Channel>> {
        let (caller, host, registry) = {
            let mut endpoints = self.lock();
            let endpoint = endpoints.get_mut(target).ok_or_else(|| XprocError::Transport {
                message: format!("no memory endpoint named {}", target),
                source: None,
            })?;

            let link = Link::new();
            endpoint.links.retain(|l| l.strong_count() > 0);
            endpoint.links.push(Arc::downgrade(&link));
            let (caller, host) = MemoryChannel::pair_with_link(target, link);
            (caller, host, endpoint.registry.clone())
        };

        let peer = host.peer();
        tokio::spawn(async move {
            if let Err(e) = registry.serve_channel(Arc::new(host)).await {
                debug!("Memory channel {} ended: {}", peer, e);
            }
        });

        Ok(Arc::new(caller))
    }
}

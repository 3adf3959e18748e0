//! Caller-side connections to a remote service.
//!
//! A [`Connection`] owns one transport channel and moves through
//! `Unbound -> Binding -> Bound -> Dead`, with `Bound -> Unbound` on an
//! explicit release. Dead is terminal. Entering Dead resolves every pending
//! call with [`XprocError::RemoteProcessGone`] and notifies the registered
//! death recipients once each.

mod manager;

pub use manager::ConnectionManager;

use crate::codec::{get_string, put_string};
use crate::config::ConnectionOptions;
use crate::descriptor::HANDSHAKE_TRANSACTION;
use crate::error::{Result, XprocError};
use crate::transport::{check_frame_size, Channel, Transport};
use crate::wire::{Direction, Transaction};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not bound to a channel. Initial state, and the state after release.
    Unbound,
    /// Transport bind and handshake in progress.
    Binding,
    /// Ready to carry calls.
    Bound,
    /// The remote end is gone. Terminal.
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unbound => write!(f, "unbound"),
            ConnectionState::Binding => write!(f, "binding"),
            ConnectionState::Bound => write!(f, "bound"),
            ConnectionState::Dead => write!(f, "dead"),
        }
    }
}

/// Receives a notification when the remote end of a connection dies.
pub trait DeathRecipient: Send + Sync {
    fn remote_died(&self, target: &str);
}

impl<F> DeathRecipient for F
where
    F: Fn(&str) + Send + Sync,
{
    fn remote_died(&self, target: &str) {
        self(target)
    }
}

type PendingReply = oneshot::Sender<Result<Transaction>>;

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn Channel>>,
    pending: HashMap<u64, PendingReply>,
    recipients: Vec<Weak<dyn DeathRecipient>>,
    /// Stops the reader task of the current binding when sent or dropped.
    reader_stop: Option<oneshot::Sender<()>>,
    /// Incremented on every successful bind so a stale reader can't kill a
    /// newer binding.
    generation: u64,
}

/// One logical connection to a service on a remote target.
pub struct Connection {
    target: String,
    interface: String,
    options: ConnectionOptions,
    next_correlation_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("interface", &self.interface)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create an unbound connection.
    pub fn new(
        target: impl Into<String>,
        interface: impl Into<String>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            target: target.into(),
            interface: interface.into(),
            options,
            next_correlation_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                state: ConnectionState::Unbound,
                channel: None,
                pending: HashMap::new(),
                recipients: Vec::new(),
                reader_stop: None,
                generation: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Bind the connection and perform the interface handshake.
    ///
    /// Binding an already bound connection is a no-op. Any failure, including
    /// the bind timeout, leaves the connection Dead.
    pub async fn bind(self: &Arc<Self>, transport: &dyn Transport) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Unbound => inner.state = ConnectionState::Binding,
                ConnectionState::Bound => return Ok(()),
                ConnectionState::Binding => return Err(XprocError::NotConnected),
                ConnectionState::Dead => return Err(XprocError::RemoteProcessGone),
            }
        }

        let timeout = self.options.bind_timeout;
        let channel = match tokio::time::timeout(timeout, self.handshake(transport)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.mark_dead(&format!("bind failed: {}", e));
                return Err(e);
            }
            Err(_) => {
                self.mark_dead("bind timed out");
                return Err(XprocError::CallTimeout(timeout));
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let generation = {
            let mut inner = self.lock();
            inner.state = ConnectionState::Bound;
            inner.channel = Some(channel.clone());
            inner.reader_stop = Some(stop_tx);
            inner.generation += 1;
            inner.generation
        };

        info!(
            "Bound {} on {} ({})",
            self.interface,
            self.target,
            channel.peer()
        );
        tokio::spawn(read_loop(Arc::downgrade(self), channel, stop_rx, generation));
        Ok(())
    }

    async fn handshake(&self, transport: &dyn Transport) -> Result<Arc<dyn Channel>> {
        let channel = transport.bind(&self.target).await?;

        match self.exchange_handshake(channel.as_ref()).await {
            Ok(()) => Ok(channel),
            Err(e) => {
                if let Err(unbind_err) = channel.unbind().await {
                    debug!("Unbind after failed handshake: {}", unbind_err);
                }
                Err(e)
            }
        }
    }

    async fn exchange_handshake(&self, channel: &dyn Channel) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, Some(&self.interface))?;
        let correlation_id = self.next_correlation_id();
        let request = Transaction::request(HANDSHAKE_TRANSACTION, correlation_id, payload.freeze());
        channel.send(request.encode()).await?;

        let frame = channel
            .receive()
            .await?
            .ok_or(XprocError::RemoteProcessGone)?;
        let response = Transaction::decode(frame)?;
        if response.direction != Direction::Response
            || response.code != HANDSHAKE_TRANSACTION
            || response.correlation_id != correlation_id
        {
            return Err(XprocError::malformed(format!(
                "unexpected handshake reply code {} id {}",
                response.code, response.correlation_id
            )));
        }

        let body = match response.into_reply() {
            Ok(body) => body,
            Err(XprocError::InterfaceMismatch { message, .. }) => {
                return Err(XprocError::InterfaceMismatch {
                    requested: self.interface.clone(),
                    message,
                })
            }
            Err(e) => return Err(e),
        };

        let mut cursor = &body[..];
        let served = get_string(&mut cursor)?;
        if served.as_deref() != Some(self.interface.as_str()) {
            return Err(XprocError::InterfaceMismatch {
                requested: self.interface.clone(),
                message: served.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// Fails with `NotConnected` unless Bound, with `RemoteProcessGone` if the
    /// connection dies before the response arrives and with `CallTimeout` when
    /// the call timeout elapses first.
    pub async fn transact(&self, code: u32, payload: Bytes) -> Result<Transaction> {
        let correlation_id = self.next_correlation_id();
        let frame = Transaction::request(code, correlation_id, payload).encode();
        check_frame_size(frame.len())?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let channel = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Bound => {}
                ConnectionState::Dead => return Err(XprocError::RemoteProcessGone),
                ConnectionState::Unbound | ConnectionState::Binding => {
                    return Err(XprocError::NotConnected)
                }
            }
            let channel = inner.channel.clone().ok_or(XprocError::NotConnected)?;
            inner.pending.insert(correlation_id, reply_tx);
            channel
        };
        let _pending = PendingGuard {
            connection: self,
            correlation_id,
        };

        debug!(
            "-> {} code {} id {} ({} bytes)",
            self.target,
            code,
            correlation_id,
            frame.len()
        );
        if let Err(e) = channel.send(frame).await {
            self.mark_dead(&format!("send failed: {}", e));
            return Err(XprocError::RemoteProcessGone);
        }

        let timeout = self.options.call_timeout;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(XprocError::RemoteProcessGone),
            Err(_) => {
                debug!(
                    "Call {} on {} timed out after {:?}",
                    correlation_id, self.target, timeout
                );
                Err(XprocError::CallTimeout(timeout))
            }
        }
    }

    /// Register `recipient` for a death notification.
    ///
    /// Only a weak reference is kept. On a connection that is already Dead the
    /// recipient is invoked immediately. Linking the same recipient twice has
    /// no effect.
    pub fn link_to_death(&self, recipient: &Arc<dyn DeathRecipient>) {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Dead {
                let ptr = recipient_ptr(recipient);
                let already = inner
                    .recipients
                    .iter()
                    .any(|r| Weak::as_ptr(r) as *const () == ptr);
                if !already {
                    inner.recipients.push(Arc::downgrade(recipient));
                }
                return;
            }
        }
        notify(recipient.as_ref(), &self.target);
    }

    /// Remove a recipient. Returns whether it was registered.
    pub fn unlink_to_death(&self, recipient: &Arc<dyn DeathRecipient>) -> bool {
        let ptr = recipient_ptr(recipient);
        let mut inner = self.lock();
        let before = inner.recipients.len();
        inner
            .recipients
            .retain(|r| Weak::as_ptr(r) as *const () != ptr);
        inner.recipients.len() != before
    }

    /// Bound -> Unbound. In-flight calls fail with `NotConnected` and death
    /// recipients are not notified. A no-op unless Bound.
    pub async fn release(&self) -> Result<()> {
        let (channel, pending) = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Bound => {}
                ConnectionState::Dead => return Err(XprocError::RemoteProcessGone),
                ConnectionState::Unbound | ConnectionState::Binding => return Ok(()),
            }
            inner.state = ConnectionState::Unbound;
            if let Some(stop) = inner.reader_stop.take() {
                let _ = stop.send(());
            }
            (inner.channel.take(), std::mem::take(&mut inner.pending))
        };

        for (_, reply) in pending {
            let _ = reply.send(Err(XprocError::NotConnected));
        }
        info!("Released {} on {}", self.interface, self.target);

        if let Some(channel) = channel {
            channel.unbind().await?;
        }
        Ok(())
    }

    fn route(&self, response: Transaction) {
        let reply = self.lock().pending.remove(&response.correlation_id);
        match reply {
            Some(reply) => {
                debug!(
                    "<- {} code {} id {}",
                    self.target, response.code, response.correlation_id
                );
                let _ = reply.send(Ok(response));
            }
            None => debug!(
                "Discarding late response id {} from {}",
                response.correlation_id, self.target
            ),
        }
    }

    fn channel_closed(&self, generation: u64, reason: &str) {
        {
            let inner = self.lock();
            if inner.generation != generation || inner.state != ConnectionState::Bound {
                return;
            }
        }
        self.mark_dead(reason);
    }

    /// Enter Dead. Resolves pending calls and notifies recipients exactly once.
    fn mark_dead(&self, reason: &str) {
        let (pending, recipients) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Dead {
                return;
            }
            inner.state = ConnectionState::Dead;
            inner.channel = None;
            inner.reader_stop = None;
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.recipients),
            )
        };

        info!(
            "Connection to {} ({}) is dead: {} ({} calls in flight)",
            self.target,
            self.interface,
            reason,
            pending.len()
        );
        for (_, reply) in pending {
            let _ = reply.send(Err(XprocError::RemoteProcessGone));
        }
        for recipient in recipients.iter().filter_map(Weak::upgrade) {
            notify(recipient.as_ref(), &self.target);
        }
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops the pending entry when the call stops waiting for any reason.
struct PendingGuard<'a> {
    connection: &'a Connection,
    correlation_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection.lock().pending.remove(&self.correlation_id);
    }
}

fn recipient_ptr(recipient: &Arc<dyn DeathRecipient>) -> *const () {
    Arc::as_ptr(recipient) as *const ()
}

fn notify(recipient: &dyn DeathRecipient, target: &str) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| recipient.remote_died(target)));
    if result.is_err() {
        warn!("Death recipient for {} panicked", target);
    }
}

async fn read_loop(
    connection: Weak<Connection>,
    channel: Arc<dyn Channel>,
    mut stop: oneshot::Receiver<()>,
    generation: u64,
) {
    let reason = loop {
        let received = tokio::select! {
            _ = &mut stop => return,
            received = channel.receive() => received,
        };
        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => break "remote end closed the channel".to_string(),
            Err(e) => break e.to_string(),
        };

        let Some(conn) = connection.upgrade() else {
            return;
        };
        match Transaction::decode(frame) {
            Ok(tx) if tx.direction == Direction::Response => conn.route(tx),
            Ok(tx) => warn!(
                "Ignoring request code {} from {}: callers don't serve requests",
                tx.code, conn.target
            ),
            Err(e) => warn!("Dropping malformed frame from {}: {}", conn.target, e),
        }
    };

    if let Some(conn) = connection.upgrade() {
        conn.channel_closed(generation, &reason);
    }
}

//! ConnectionManager - one live connection per (target, interface).

use super::{Connection, ConnectionState};
use crate::config::ConnectionOptions;
use crate::descriptor::InterfaceDescriptor;
use crate::error::Result;
use crate::error_handler::ErrorHandler;
use crate::proxy::Proxy;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

type Key = (String, String);
type Slot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Hands out proxies, binding and reusing connections as needed.
///
/// Concurrent `connect` calls for the same key wait on each other so only one
/// bind happens; different keys bind independently.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    slots: Mutex<HashMap<Key, Slot>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ConnectionOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        Self {
            transport,
            options,
            error_handler: None,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Root error handler for every proxy this manager hands out.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Get a proxy for `descriptor` on `target`.
    ///
    /// A Bound connection for the same key is reused. A Dead or released one
    /// is replaced by a fresh connection.
    pub async fn connect(
        &self,
        target: &str,
        descriptor: Arc<InterfaceDescriptor>,
    ) -> Result<Proxy> {
        let slot = self.slot(target, descriptor.name());
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.state() == ConnectionState::Bound {
                return Ok(self.proxy(descriptor, existing.clone()));
            }
            debug!(
                "Replacing {} connection to {} ({})",
                existing.state(),
                target,
                descriptor.name()
            );
        }

        let connection = Arc::new(Connection::new(
            target,
            descriptor.name(),
            self.options.clone(),
        ));
        let bound = connection.bind(self.transport.as_ref()).await;
        // A failed connection stays in the slot until the next connect.
        *current = Some(connection.clone());
        bound?;

        Ok(self.proxy(descriptor, connection))
    }

    fn proxy(&self, descriptor: Arc<InterfaceDescriptor>, connection: Arc<Connection>) -> Proxy {
        let proxy = Proxy::new(descriptor, connection);
        match &self.error_handler {
            Some(handler) => proxy.with_error_handler(handler.clone()),
            None => proxy,
        }
    }

    /// Current connection for the key, in whatever state it is in.
    pub async fn connection(&self, target: &str, interface: &str) -> Option<Arc<Connection>> {
        let slot = self.existing_slot(target, interface)?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Release the connection for the key (Bound -> Unbound).
    pub async fn release(&self, target: &str, interface: &str) -> Result<()> {
        let Some(slot) = self.existing_slot(target, interface) else {
            return Ok(());
        };
        let connection = slot.lock().await.clone();
        match connection {
            Some(connection) => connection.release().await,
            None => Ok(()),
        }
    }

    fn slot(&self, target: &str, interface: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry((target.to_string(), interface.to_string()))
            .or_default()
            .clone()
    }

    fn existing_slot(&self, target: &str, interface: &str) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&(target.to_string(), interface.to_string()))
            .cloned()
    }
}

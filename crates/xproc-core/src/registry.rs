//! Service registry for a hosting process.
//!
//! A host registers one dispatcher per interface name. Each incoming channel
//! starts with a handshake naming the interface it wants; the registry answers
//! it and hands the channel to the matching dispatcher.

use crate::codec::{get_string, put_string};
use crate::config::DispatcherOptions;
use crate::descriptor::{InterfaceDescriptor, HANDSHAKE_TRANSACTION};
use crate::error::{Result, XprocError};
use crate::stub::{ServiceObject, StubDispatcher};
use crate::transport::Channel;
use crate::wire::{Direction, Transaction};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Dispatchers hosted by this process, keyed by interface name.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<StubDispatcher>>>,
    options: DispatcherOptions,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_options(DispatcherOptions::default())
    }

    /// Registry whose dispatchers all use `options`.
    pub fn with_options(options: DispatcherOptions) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// Expose `service` under the descriptor's interface name, replacing any
    /// previous binding of that name.
    pub fn bind_service(
        &self,
        descriptor: Arc<InterfaceDescriptor>,
        service: Arc<dyn ServiceObject>,
    ) -> Arc<StubDispatcher> {
        let name = descriptor.name().to_string();
        let dispatcher = Arc::new(StubDispatcher::new(
            descriptor,
            service,
            self.options.clone(),
        ));

        let previous = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), dispatcher.clone());
        if previous.is_some() {
            info!("Replaced service binding for {}", name);
        } else {
            info!("Bound service {}", name);
        }
        dispatcher
    }

    /// Stop accepting new channels for `interface`. Channels already being
    /// served keep their dispatcher.
    pub fn unbind_service(&self, interface: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(interface)
            .is_some()
    }

    pub fn dispatcher(&self, interface: &str) -> Option<Arc<StubDispatcher>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(interface)
            .cloned()
    }

    /// Registered interface names, sorted.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Answer the handshake on `channel`, then serve it until it closes.
    pub async fn serve_channel(self: Arc<Self>, channel: Arc<dyn Channel>) -> Result<()> {
        let Some(frame) = channel.receive().await? else {
            return Ok(());
        };
        let request = Transaction::decode(frame)?;
        if request.direction != Direction::Request || request.code != HANDSHAKE_TRANSACTION {
            warn!(
                "{} skipped the handshake (code {}), closing",
                channel.peer(),
                request.code
            );
            channel.unbind().await?;
            return Err(XprocError::malformed("expected handshake transaction"));
        }

        let mut cursor = &request.payload[..];
        let requested = get_string(&mut cursor)?.unwrap_or_default();

        let Some(dispatcher) = self.dispatcher(&requested) else {
            let err = XprocError::InterfaceMismatch {
                requested: requested.clone(),
                message: format!("host serves [{}]", self.interfaces().join(", ")),
            };
            debug!("Refusing {} from {}", requested, channel.peer());
            let reply = Transaction::error_response(HANDSHAKE_TRANSACTION, request.correlation_id, &err);
            channel.send(reply.encode()).await?;
            channel.unbind().await?;
            return Err(err);
        };

        let mut body = BytesMut::new();
        put_string(&mut body, Some(dispatcher.descriptor().name()))?;
        let reply = Transaction::ok_response(HANDSHAKE_TRANSACTION, request.correlation_id, &body);
        channel.send(reply.encode()).await?;

        dispatcher.serve(channel).await
    }
}

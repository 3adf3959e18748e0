//! Callee-side stub dispatcher.
//!
//! Requests are read from a channel in receipt order. Each one waits for a
//! worker permit before the next request is read, then runs on its own task,
//! so responses can complete out of order when more than one worker is
//! configured. Every request gets a response: unknown codes, undecodable
//! arguments, service errors and panics all become error responses.

use crate::codec::{decode_arguments, encode_return, Value};
use crate::config::DispatcherOptions;
use crate::descriptor::{InterfaceDescriptor, MethodDescriptor};
use crate::error::{Result, XprocError};
use crate::transport::Channel;
use crate::versioning::unsupported_response;
use crate::wire::{Direction, Transaction};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// The real implementation behind a dispatcher.
///
/// Arguments arrive already decoded and checked against the method's
/// declared types.
#[async_trait]
pub trait ServiceObject: Send + Sync + 'static {
    async fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value>;
}

/// Routes request transactions to a [`ServiceObject`].
pub struct StubDispatcher {
    descriptor: Arc<InterfaceDescriptor>,
    service: Arc<dyn ServiceObject>,
    options: DispatcherOptions,
}

impl StubDispatcher {
    pub fn new(
        descriptor: Arc<InterfaceDescriptor>,
        service: Arc<dyn ServiceObject>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            descriptor,
            service,
            options,
        }
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    /// Produce the response for one request.
    pub async fn dispatch(&self, request: Transaction) -> Transaction {
        let Some(method) = self.descriptor.method_by_code(request.code) else {
            return unsupported_response(&self.descriptor, &request);
        };

        match self.execute(method, &request.payload).await {
            Ok(body) => Transaction::ok_response(request.code, request.correlation_id, &body),
            Err(e) => {
                warn!(
                    "{}.{} (id {}) failed: {}",
                    self.descriptor.name(),
                    method.name(),
                    request.correlation_id,
                    e
                );
                Transaction::error_response(request.code, request.correlation_id, &e)
            }
        }
    }

    async fn execute(&self, method: &MethodDescriptor, payload: &[u8]) -> Result<Bytes> {
        let args = decode_arguments(method, payload)?;

        let invocation = AssertUnwindSafe(self.service.invoke(method, args))
            .catch_unwind()
            .await;
        let value = match invocation {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(service_failure(e)),
            Err(panic) => {
                return Err(XprocError::RemoteFailure {
                    message: format!("service panicked: {}", panic_message(panic.as_ref())),
                })
            }
        };

        encode_return(method, &value).map_err(|e| {
            XprocError::malformed(format!("{} returned a bad value: {}", method.name(), e))
        })
    }

    /// Serve requests from `channel` until the peer goes away.
    ///
    /// A frame that is not a well-formed request transaction ends the channel,
    /// since no response can be addressed to it.
    pub async fn serve(self: Arc<Self>, channel: Arc<dyn Channel>) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let peer = channel.peer();
        debug!("Serving {} for {}", self.descriptor.name(), peer);

        loop {
            let Some(frame) = channel.receive().await? else {
                debug!("{} closed its channel", peer);
                return Ok(());
            };

            let request = match Transaction::decode(frame) {
                Ok(tx) if tx.direction == Direction::Request => tx,
                Ok(tx) => {
                    warn!("Dropping response id {} sent by caller {}", tx.correlation_id, peer);
                    continue;
                }
                Err(e) => {
                    warn!("Malformed frame from {}, closing: {}", peer, e);
                    channel.unbind().await?;
                    return Err(e);
                }
            };

            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| XprocError::Transport {
                    message: format!("worker pool for {} closed", peer),
                    source: None,
                })?;

            let dispatcher = self.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let correlation_id = request.correlation_id;
                let response = dispatcher.dispatch(request).await;
                if let Err(e) = channel.send(response.encode()).await {
                    debug!("Response id {} not delivered: {}", correlation_id, e);
                }
                drop(permit);
            });
        }
    }
}

fn service_failure(err: XprocError) -> XprocError {
    match err {
        XprocError::RemoteFailure { .. } => err,
        other => XprocError::RemoteFailure {
            message: other.to_string(),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

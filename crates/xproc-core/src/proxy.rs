//! Caller-side proxy.
//!
//! A [`Proxy`] pairs an interface descriptor with a connection and turns
//! method calls into request transactions.

use crate::codec::{decode_return, encode_arguments, Value, WireType};
use crate::connection::{Connection, ConnectionState};
use crate::descriptor::{InterfaceDescriptor, MethodDescriptor};
use crate::error::{Result, XprocError};
use crate::error_handler::ErrorHandler;
use crate::versioning::resolve_unsupported;
use std::sync::Arc;
use tracing::debug;

/// Handle for calling methods on a remote service.
#[derive(Clone)]
pub struct Proxy {
    descriptor: Arc<InterfaceDescriptor>,
    connection: Arc<Connection>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("interface", &self.descriptor.name())
            .field("connection", &self.connection)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl Proxy {
    pub fn new(descriptor: Arc<InterfaceDescriptor>, connection: Arc<Connection>) -> Self {
        Self {
            descriptor,
            connection,
            error_handler: None,
        }
    }

    /// Replace the error handler of this proxy.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.descriptor
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Call `method` with `args`.
    ///
    /// An `UnsupportedMethod` reply for a method with a default body yields
    /// the default's result instead of an error. Remaining failures of
    /// `void` and `string?` methods go through the error handler, which may
    /// turn them into `Void` or the null string.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let method = self
            .descriptor
            .method(method)
            .ok_or_else(|| XprocError::UnknownMethod {
                name: method.to_string(),
            })?;

        match self.call_remote(method, &args).await {
            Ok(value) => Ok(value),
            Err(err) => self.absorb(method, err),
        }
    }

    fn absorb(&self, method: &MethodDescriptor, err: XprocError) -> Result<Value> {
        let absent = match method.return_type() {
            WireType::Void => Value::Void,
            WireType::NullableString => Value::null_string(),
            _ => return Err(err),
        };
        match &self.error_handler {
            Some(handler) if handler.handle_error(method.name(), &err) => {
                debug!(
                    "{}.{} failed and was absorbed: {}",
                    self.descriptor.name(),
                    method.name(),
                    err
                );
                Ok(absent)
            }
            _ => Err(err),
        }
    }

    async fn call_remote(&self, method: &MethodDescriptor, args: &[Value]) -> Result<Value> {
        match self.connection.state() {
            ConnectionState::Bound => {}
            ConnectionState::Dead => return Err(XprocError::RemoteProcessGone),
            ConnectionState::Unbound | ConnectionState::Binding => {
                return Err(XprocError::NotConnected)
            }
        }

        let payload = encode_arguments(method, args)?;
        let response = self.connection.transact(method.code(), payload).await?;
        match response.into_reply() {
            Ok(body) => decode_return(method, &body),
            Err(err) => resolve_unsupported(method, args, err),
        }
    }
}

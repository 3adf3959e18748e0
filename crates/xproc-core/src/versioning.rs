//! Forward-compatible method evolution.
//!
//! A caller built against a newer contract may send codes an older service
//! never heard of. The dispatcher answers those with an explicit
//! `UnsupportedMethod` response, and the proxy substitutes the method's local
//! default body when it has one.

use crate::codec::Value;
use crate::descriptor::{InterfaceDescriptor, MethodDescriptor};
use crate::error::{Result, XprocError};
use crate::wire::Transaction;
use tracing::debug;

/// Dispatcher side: the response for a request whose code has no method.
pub fn unsupported_response(descriptor: &InterfaceDescriptor, request: &Transaction) -> Transaction {
    if descriptor.is_retired(request.code) {
        debug!(
            "{}: code {} belongs to a retired method",
            descriptor.name(),
            request.code
        );
    } else {
        debug!("{}: unknown code {}", descriptor.name(), request.code);
    }
    let err = XprocError::UnsupportedMethod { code: request.code };
    Transaction::error_response(request.code, request.correlation_id, &err)
}

/// Proxy side: turn an `UnsupportedMethod` reply into the default result when
/// `method` has a default body. Every other error is returned unchanged.
pub fn resolve_unsupported(
    method: &MethodDescriptor,
    args: &[Value],
    err: XprocError,
) -> Result<Value> {
    if !matches!(err, XprocError::UnsupportedMethod { .. }) {
        return Err(err);
    }
    match method.run_default(args) {
        Some(result) => {
            debug!(
                "Remote lacks {} (code {}), using local default",
                method.name(),
                method.code()
            );
            result
        }
        None => Err(err),
    }
}
